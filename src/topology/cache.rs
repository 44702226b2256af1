//! Invalidation of lazily built indices.

/// Structures holding indices derived from their own contents, such as the
/// sorted child element index of a generation, rebuild them on demand after
/// `invalidate_cache` is called. Call it whenever the entity set changes.
pub trait InvalidateCache {
    fn invalidate_cache(&mut self);
}

impl<T: InvalidateCache + ?Sized> InvalidateCache for Box<T> {
    fn invalidate_cache(&mut self) {
        (**self).invalidate_cache();
    }
}
