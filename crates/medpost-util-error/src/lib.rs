//! One-line rendering of error chains for structured log fields.
//!
//! `tracing` fields formatted with `%err` only show the outermost error,
//! which for pipeline steps is usually just "HTTP request failed". Use
//! `err = %err.fmt_compact()` to get the whole `source()` chain joined
//! with `: `.

use std::{error, fmt, iter};

/// Display adapter returned by [`FmtCompact::fmt_compact`].
pub struct CompactChain<'e>(&'e (dyn error::Error + 'e));

impl fmt::Display for CompactChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = iter::successors(Some(self.0), |err| err.source());

        for (i, err) in chain.enumerate() {
            if 0 < i {
                f.write_str(": ")?;
            }
            write!(f, "{err}")?;
        }

        Ok(())
    }
}

pub trait FmtCompact<'e> {
    fn fmt_compact(self) -> CompactChain<'e>;
}

impl<'e, E> FmtCompact<'e> for &'e E
where
    E: error::Error + 'e,
{
    fn fmt_compact(self) -> CompactChain<'e> {
        CompactChain(self)
    }
}
