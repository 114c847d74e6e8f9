use heapless::Vec;

use crate::error::Error;

/// Maximum number of subscribers per category.
pub const SUBSCRIBERS: usize = 2;

/// Event categories the engine dispatches to upper layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Category {
    /// A command reached its terminal classification.
    AtResponse = 0,
    /// A line that no command asked for.
    Unsolicited = 1,
    /// The data carrier dropped while in transparent mode.
    CarrierLost = 2,
    /// Transparent payload is waiting and nobody is reading it.
    DataArrived = 3,
}

const CATEGORIES: usize = 4;

/// Payload handed to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Notification<'a> {
    /// Terminal marker of the finished command, e.g. `OK` or `CONNECT`.
    Response(&'a str),
    Unsolicited(&'a str),
    CarrierLost,
    /// Number of transparent bytes buffered so far.
    DataArrived(usize),
}

impl Notification<'_> {
    pub fn category(&self) -> Category {
        match self {
            Notification::Response(_) => Category::AtResponse,
            Notification::Unsolicited(_) => Category::Unsolicited,
            Notification::CarrierLost => Category::CarrierLost,
            Notification::DataArrived(_) => Category::DataArrived,
        }
    }
}

/// A subscriber. A non-zero return value is reported as the dispatch result.
pub type Handler = fn(&Notification<'_>) -> i32;

/// Fixed-capacity table of subscribers per event category.
#[derive(Default)]
pub struct CallbackRegistry {
    slots: [Vec<Handler, SUBSCRIBERS>; CATEGORIES],
}

impl CallbackRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
        }
    }

    /// Adds `handler` after the existing subscribers of `category`.
    ///
    /// Subscribing a handler twice keeps a single entry, at the end.
    pub fn subscribe(&mut self, category: Category, handler: Handler) -> crate::Result<()> {
        self.unsubscribe(category, handler);
        self.slots[category as usize].push(handler).map_err(|_| Error::RegistryFull)
    }

    /// Removes `handler` from `category`. Removing an absent handler is a no-op.
    pub fn unsubscribe(&mut self, category: Category, handler: Handler) {
        self.slots[category as usize].retain(|h| !core::ptr::fn_addr_eq(*h, handler));
    }

    /// Copy of the current subscribers, so that they can be called without holding the
    /// registry.
    pub fn handlers(&self, category: Category) -> Vec<Handler, SUBSCRIBERS> {
        self.slots[category as usize].clone()
    }

    /// Calls every subscriber in registration order.
    ///
    /// Returns the last non-zero handler result, or zero.
    pub fn dispatch(&self, notification: &Notification<'_>) -> i32 {
        dispatch_to(&self.handlers(notification.category()), notification)
    }
}

pub fn dispatch_to(handlers: &[Handler], notification: &Notification<'_>) -> i32 {
    let mut result = 0;
    for handler in handlers {
        let ret = handler(notification);
        if ret != 0 {
            result = ret;
        }
    }
    result
}

#[cfg(test)]
mod test_callbacks {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRST_CALLS: AtomicUsize = AtomicUsize::new(0);
    static SECOND_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn first(_: &Notification<'_>) -> i32 {
        FIRST_CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn second(_: &Notification<'_>) -> i32 {
        SECOND_CALLS.fetch_add(1, Ordering::SeqCst);
        7
    }

    fn failing(_: &Notification<'_>) -> i32 {
        -1
    }

    fn ok(_: &Notification<'_>) -> i32 {
        0
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        let mut registry = CallbackRegistry::new();
        let urc = Notification::Unsolicited("+PBREADY");

        registry.subscribe(Category::Unsolicited, first).unwrap();
        let before = FIRST_CALLS.load(Ordering::SeqCst);
        registry.dispatch(&urc);
        assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), before + 1);

        registry.unsubscribe(Category::Unsolicited, first);
        registry.dispatch(&urc);
        assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), before + 1);

        registry.subscribe(Category::Unsolicited, first).unwrap();
        registry.subscribe(Category::Unsolicited, first).unwrap();
        registry.dispatch(&urc);
        assert_eq!(FIRST_CALLS.load(Ordering::SeqCst), before + 2);
        assert_eq!(registry.handlers(Category::Unsolicited).len(), 1);
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let mut registry = CallbackRegistry::new();
        registry.unsubscribe(Category::CarrierLost, ok);
        registry.subscribe(Category::CarrierLost, ok).unwrap();
        registry.unsubscribe(Category::DataArrived, ok);
        assert_eq!(registry.handlers(Category::CarrierLost).len(), 1);
    }

    #[test]
    fn test_dispatch_continues_after_failure() {
        let mut registry = CallbackRegistry::new();
        registry.subscribe(Category::DataArrived, failing).unwrap();
        registry.subscribe(Category::DataArrived, second).unwrap();
        let before = SECOND_CALLS.load(Ordering::SeqCst);
        assert_eq!(registry.dispatch(&Notification::DataArrived(12)), 7);
        assert_eq!(SECOND_CALLS.load(Ordering::SeqCst), before + 1);

        let mut registry = CallbackRegistry::new();
        registry.subscribe(Category::DataArrived, second).unwrap();
        registry.subscribe(Category::DataArrived, failing).unwrap();
        assert_eq!(registry.dispatch(&Notification::DataArrived(12)), -1);
    }

    #[test]
    fn test_registry_capacity() {
        let mut registry = CallbackRegistry::new();
        registry.subscribe(Category::AtResponse, ok).unwrap();
        registry.subscribe(Category::AtResponse, failing).unwrap();
        assert_eq!(
            registry.subscribe(Category::AtResponse, first),
            Err(Error::RegistryFull)
        );
        // Other categories are independent.
        registry.subscribe(Category::Unsolicited, first).unwrap();
    }
}
