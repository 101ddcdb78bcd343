use taskd_protocol::Event;

/// One server-sent event: `id`, `event` name and JSON `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: u64,
    pub event: &'static str,
    pub data: String,
}

impl SseFrame {
    pub fn from_event(id: u64, event: &Event) -> Self {
        Self {
            id,
            event: event.name(),
            data: event.payload().to_string(),
        }
    }
}

/// Numbers the frames of one stream, starting at 1.
#[derive(Debug, Default)]
pub struct SseEncoder {
    last_id: u64,
}

impl SseEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&mut self, event: &Event) -> SseFrame {
        self.last_id += 1;
        SseFrame::from_event(self.last_id, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_protocol::{EVENT_CHANGE, EVENT_OUTPUT};

    fn output(line: &str) -> Event {
        Event::Output {
            task_id: "t1".to_string(),
            seq: 1,
            line: line.to_string(),
        }
    }

    #[test]
    fn frames_output_line() {
        let mut encoder = SseEncoder::new();
        let frame = encoder.frame(&output("epoch 1/10"));
        assert_eq!(
            frame,
            SseFrame {
                id: 1,
                event: EVENT_OUTPUT,
                data: r#"{"t1":"epoch 1/10"}"#.to_string(),
            }
        );
    }

    #[test]
    fn ids_increase_per_stream() {
        let mut encoder = SseEncoder::new();
        let first = encoder.frame(&output("a"));
        let second = encoder.frame(&Event::Snapshot { tasks: vec![] });
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(second.event, EVENT_CHANGE);
        assert_eq!(second.data, "{}");

        let mut other = SseEncoder::new();
        assert_eq!(other.frame(&output("b")).id, 1);
    }
}
