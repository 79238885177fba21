use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::future::{BoxFuture, FutureExt};

use crate::context::{handler_fn, Context};
use crate::error::Error;

/// Returns a middleware recovering from panics raised further down the chain.
///
/// The panic is recorded as a recovered [`Error::Panic`] and the chain is aborted.
pub fn recovery() -> impl for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static
{
    handler_fn(|c| {
        Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(c.next()).catch_unwind().await {
                c.error(Error::Panic(panic_message(payload.as_ref())));
                c.abort();
            }
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
