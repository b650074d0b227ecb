//! Data sources consumed by the training loop.

/// A sized, re-iterable sequence of mini-batches.
///
/// `len` is read once at the start of every epoch and must match the number of
/// items `batches` yields for that epoch.
pub trait DataLoader {
    type Batch;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over one epoch worth of mini-batches.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Self::Batch> + '_>;
}

impl<T: Clone> DataLoader for Vec<T> {
    type Batch = T;

    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = T> + '_> {
        Box::new(self.iter().cloned())
    }
}
