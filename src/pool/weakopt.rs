use std::fmt;
use std::sync::Arc;

use std::sync::Weak;

use crate::DebugLiteral;

/// An optional weak reference, which may be created empty.
pub(crate) struct WeakOpt<T: ?Sized>(Option<Weak<T>>);

impl<T: ?Sized> WeakOpt<T> {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn from_weak(weak: Weak<T>) -> Self {
        Self(Some(weak))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(|weak| weak.upgrade())
    }
}

impl<T: ?Sized> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f
                .debug_tuple("WeakOpt")
                .field(&DebugLiteral("Some(...)"))
                .finish(),
            None => f
                .debug_tuple("WeakOpt")
                .field(&DebugLiteral("None"))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &'static str;
    }

    struct Upstream;

    impl Named for Upstream {
        fn name(&self) -> &'static str {
            "upstream"
        }
    }

    #[test]
    fn weak_opt() {
        let arc = Arc::new(());
        let weak = WeakOpt::from_weak(Arc::downgrade(&arc));
        assert!(weak.upgrade().is_some());
        drop(arc);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_opt_unsized() {
        let arc = Arc::new(Upstream);
        let weak = Arc::downgrade(&arc);
        let weak: Weak<dyn Named> = weak;
        let weak = WeakOpt::from_weak(weak);
        assert_eq!(weak.upgrade().map(|n| n.name()), Some("upstream"));
        drop(arc);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_opt_none() {
        let weak = WeakOpt::<()>::none();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_opt_debug() {
        let arc = Arc::new(());
        let weak = WeakOpt::from_weak(Arc::downgrade(&arc));
        assert_eq!(format!("{weak:?}"), "WeakOpt(Some(...))");

        let weak: WeakOpt<()> = WeakOpt::none();
        assert_eq!(format!("{weak:?}"), "WeakOpt(None)");
    }
}
