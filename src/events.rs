//! A small bus of named events: the Maker publishes, the CLIs
//! subscribe to render progress. The set of event names is fixed at
//! construction; listening to or triggering an unknown name is an
//! error.

use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("unknown event {0:?}")]
    EventUnknown(String),
}

/// What an event carries. Most events carry nothing; progress events
/// carry `(done, total)`; start events may carry a count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventPayload {
    pub progress: Option<(usize, usize)>,
    pub count: Option<usize>,
}

impl EventPayload {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn progress(done: usize, total: usize) -> Self {
        Self {
            progress: Some((done, total)),
            ..Self::default()
        }
    }
}

type Listener = Box<dyn FnMut(&EventPayload)>;

pub struct Events {
    listeners: BTreeMap<String, Vec<Listener>>,
}

impl Events {
    pub fn new<S: Into<String>>(events: impl IntoIterator<Item = S>) -> Self {
        Self {
            listeners: events
                .into_iter()
                .map(|name| (name.into(), Vec::new()))
                .collect(),
        }
    }

    pub fn add_listener(
        &mut self,
        event: &str,
        listener: impl FnMut(&EventPayload) + 'static,
    ) -> Result<(), EventError> {
        self.listeners
            .get_mut(event)
            .ok_or_else(|| EventError::EventUnknown(event.to_owned()))?
            .push(Box::new(listener));
        Ok(())
    }

    /// Call every listener of `event`, in registration order.
    pub fn trigger(&mut self, event: &str, payload: EventPayload) -> Result<(), EventError> {
        let listeners = self
            .listeners
            .get_mut(event)
            .ok_or_else(|| EventError::EventUnknown(event.to_owned()))?;
        for listener in listeners {
            listener(&payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn t_listeners_run_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut events = Events::new(["wait-progress", "wait-end"]);

        let s = seen.clone();
        events
            .add_listener("wait-progress", move |p| {
                s.borrow_mut().push(("first", p.progress));
            })
            .unwrap();
        let s = seen.clone();
        events
            .add_listener("wait-progress", move |p| {
                s.borrow_mut().push(("second", p.progress));
            })
            .unwrap();

        events
            .trigger("wait-progress", EventPayload::progress(1, 4))
            .unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![("first", Some((1, 4))), ("second", Some((1, 4)))]
        );
    }

    #[test]
    fn t_unknown_event() {
        let mut events = Events::new(["run-start"]);
        assert!(matches!(
            events.add_listener("run-finish", |_| ()),
            Err(EventError::EventUnknown(_))
        ));
        assert!(matches!(
            events.trigger("run-finish", EventPayload::none()),
            Err(EventError::EventUnknown(_))
        ));
    }
}
