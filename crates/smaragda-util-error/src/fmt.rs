use std::error::Error;
use std::fmt;

/// Display an error together with its source chain on a single line.
///
/// The standard `Display` of most errors prints only the outermost message;
/// logging wants the whole chain without the multi-line `Debug` noise.
pub struct CompactError<'e, E: ?Sized>(&'e E);

impl<E> fmt::Display for CompactError<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    type Report<'e>: fmt::Display
    where
        Self: 'e;

    fn fmt_compact(&self) -> Self::Report<'_>;
}

impl<E> FmtCompact for E
where
    E: Error + ?Sized,
{
    type Report<'e>
        = CompactError<'e, E>
    where
        E: 'e;

    fn fmt_compact(&self) -> Self::Report<'_> {
        CompactError(self)
    }
}
