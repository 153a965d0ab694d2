/// Approximate in-memory size in bytes, used for buffer accounting.
pub trait SizeHint {
    fn size_hint(&self) -> usize;
}

impl<T> SizeHint for Option<T>
where
    T: SizeHint,
{
    fn size_hint(&self) -> usize {
        self.as_ref().map_or(0, SizeHint::size_hint)
    }
}

impl<T> SizeHint for [T]
where
    T: SizeHint,
{
    fn size_hint(&self) -> usize {
        self.iter().map(SizeHint::size_hint).sum()
    }
}

impl<T> SizeHint for Vec<T>
where
    T: SizeHint,
{
    fn size_hint(&self) -> usize {
        self.as_slice().size_hint()
    }
}
