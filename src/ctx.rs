//! `map_err` helper: `.map_err(ctx!("reading {path:?}"))` wraps the
//! error in an `anyhow::Error` carrying the formatted context string.

#[macro_export]
macro_rules! ctx {
    ($($arg:tt)*) => {
        |e| anyhow::Error::from(e).context(format!($($arg)*))
    };
}
