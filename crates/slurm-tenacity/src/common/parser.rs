use std::fmt::{Debug, Display, Formatter};

use nom::character::complete::satisfy;
use nom::combinator::{all_consuming, map, map_res};
use nom::error::{ContextError, ErrorKind, FromExternalError, ParseError};
use nom::multi::many0;
use nom::{AsChar, IResult, Parser};

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {}", error)),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{:?}': expecting {:?}",
                input, error
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I> ContextError<I> for ParserError<I> {}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Runs `parser` on the whole `input` and fails if any input remains unconsumed.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: Parser<&'a str, O, ParserError<&'a str>>,
{
    all_consuming(parser)(input)
        .map(|(_, output)| output)
        .map_err(format_parse_error)
}

fn p_integer_string(input: &str) -> NomResult<String> {
    let parser = nom::sequence::tuple((
        satisfy(|c| c.is_dec_digit()),
        many0(satisfy(|c| c.is_dec_digit())),
    ));
    map(parser, |(first, rest)| {
        let mut number = first.to_string();
        number.extend(rest);
        number
    })(input)
}

pub fn p_u64(input: &str) -> NomResult<u64> {
    map_res(p_integer_string, |number| number.parse::<u64>())(input)
}
