//! Capability traits implemented by the host runtime.
//!
//! The engine never inspects host objects. It only needs to ask an
//! object for its [`Uid`], to clone strong handles, and to downgrade a
//! strong handle into a weak one that can later be upgraded again.
//! Blanket implementations cover `Arc<T>` / `std::sync::Weak<T>`, which
//! is what the test host and most embedders use.

use std::sync::{Arc, Weak};

use crate::id::Uid;

/// An object that carries an engine-assigned [`Uid`].
pub trait ObjectIdentity {
    /// The uid assigned when the object was allocated.
    fn uid(&self) -> Uid;
}

/// A weak handle that may be upgraded to a strong one.
pub trait WeakHandle: Clone + Send + 'static {
    /// The strong handle type produced by [`upgrade`](WeakHandle::upgrade).
    type Strong;

    /// Returns the strong handle if the target is still alive.
    fn upgrade(&self) -> Option<Self::Strong>;
}

/// A strong, cloneable handle to a host object.
///
/// Replay keeps strong clones of objects whose recorded weak references
/// stayed alive and of objects queued for finalization, so a handle must
/// be cheap to clone and safe to move between threads.
pub trait HostObject: ObjectIdentity + Clone + Send + 'static {
    /// The matching weak handle.
    type Weak: WeakHandle<Strong = Self>;

    /// Create a weak handle to the same object.
    fn downgrade(&self) -> Self::Weak;
}

impl<T: ObjectIdentity + ?Sized> ObjectIdentity for Arc<T> {
    fn uid(&self) -> Uid {
        (**self).uid()
    }
}

impl<T: ObjectIdentity + Send + Sync + 'static> HostObject for Arc<T> {
    type Weak = Weak<T>;

    fn downgrade(&self) -> Weak<T> {
        Arc::downgrade(self)
    }
}

impl<T: Send + Sync + 'static> WeakHandle for Weak<T> {
    type Strong = Arc<T>;

    fn upgrade(&self) -> Option<Arc<T>> {
        Weak::upgrade(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Obj(u64);

    impl ObjectIdentity for Obj {
        fn uid(&self) -> Uid {
            Uid(self.0)
        }
    }

    #[test]
    fn arc_handles_round_trip() {
        let strong = Arc::new(Obj(3));
        assert_eq!(strong.uid(), Uid(3));
        let weak = HostObject::downgrade(&strong);
        let again = WeakHandle::upgrade(&weak).map(|o| o.uid());
        assert_eq!(again, Some(Uid(3)));
        drop(strong);
        assert!(WeakHandle::upgrade(&weak).is_none());
    }
}
