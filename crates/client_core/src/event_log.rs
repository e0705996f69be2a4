use shared::domain::KeyboardEvent;

/// Ordered in-memory log of key events for the current session.
///
/// The WebSocket path appends one event at a time, while `init_events` and
/// HTTP polling hand over the backend's full list, which replaces the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    events: Vec<KeyboardEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: KeyboardEvent) {
        self.events.push(event);
    }

    pub fn replace(&mut self, events: Vec<KeyboardEvent>) {
        self.events = events;
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[KeyboardEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::KeyEventKind;

    use super::*;

    fn event(key: &str, kind: KeyEventKind, ts: f64) -> KeyboardEvent {
        KeyboardEvent::new(key, kind, ts)
    }

    #[test]
    fn append_preserves_arrival_order() {
        let mut log = EventLog::new();
        log.append(event("a", KeyEventKind::Press, 1.0));
        log.append(event("a", KeyEventKind::Release, 1.1));
        log.append(event("b", KeyEventKind::Press, 0.5));

        let keys: Vec<_> = log.events().iter().map(|e| (e.key.as_str(), e.kind)).collect();
        assert_eq!(
            keys,
            vec![
                ("a", KeyEventKind::Press),
                ("a", KeyEventKind::Release),
                ("b", KeyEventKind::Press),
            ]
        );
    }

    #[test]
    fn replace_discards_previous_contents() {
        let mut log = EventLog::new();
        log.append(event("x", KeyEventKind::Press, 1.0));
        log.append(event("y", KeyEventKind::Press, 2.0));

        log.replace(vec![event("z", KeyEventKind::Release, 3.0)]);

        assert_eq!(log.len(), 1);
        assert_eq!(log.events()[0].key, "z");
    }

    #[test]
    fn replacing_with_the_same_list_twice_does_not_duplicate() {
        let snapshot = vec![
            event("q", KeyEventKind::Press, 1.0),
            event("q", KeyEventKind::Release, 1.2),
        ];
        let mut log = EventLog::new();
        log.replace(snapshot.clone());
        log.replace(snapshot.clone());
        assert_eq!(log.events(), snapshot.as_slice());
    }

    #[test]
    fn clear_empties_the_log() {
        let mut log = EventLog::new();
        log.append(event("a", KeyEventKind::Press, 1.0));
        log.clear();
        assert!(log.is_empty());
    }
}
