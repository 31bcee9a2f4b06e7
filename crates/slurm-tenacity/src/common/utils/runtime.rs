use std::future::Future;

use crate::common::error::usage_error;

/// Runs `future` to completion on a private current-thread runtime.
///
/// Fails with a usage error when called from within an async runtime; `alternative` names
/// the async function that should be used there instead.
pub fn block_on<F: Future>(future: F, alternative: &str) -> crate::Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return usage_error(format!(
            "Blocking calls cannot be used inside an async runtime, use `{alternative}`"
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}
