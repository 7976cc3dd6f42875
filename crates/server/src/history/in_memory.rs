use scribble_protocol::{Message, ProtocolVersion};

use super::{HistoryCore, HistoryError, SessionHistory};

/// Session history kept only in memory. Lost when the server stops.
pub struct InMemoryHistory {
    core: HistoryCore,
    messages: Vec<Message>,
}

impl InMemoryHistory {
    pub fn new(
        id: impl Into<String>,
        alias: Option<String>,
        version: ProtocolVersion,
        founder: impl Into<String>,
    ) -> Self {
        Self {
            core: HistoryCore::new(id, alias, version, founder),
            messages: Vec::new(),
        }
    }
}

impl SessionHistory for InMemoryHistory {
    fn core(&self) -> &HistoryCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HistoryCore {
        &mut self.core
    }

    fn history_add(&mut self, msg: &Message) -> Result<(), HistoryError> {
        self.messages.push(msg.clone());
        Ok(())
    }

    fn history_reset(&mut self, messages: &[Message], _first_seq: u64) -> Result<(), HistoryError> {
        self.messages = messages.to_vec();
        Ok(())
    }

    fn get_batch(&self, after: u64) -> (Vec<Message>, u64) {
        let first = self.core.first_seq;
        let offset = (after + 1).saturating_sub(first) as usize;
        let last = first + self.messages.len() as u64 - 1;
        if offset >= self.messages.len() {
            return (Vec::new(), last);
        }
        (self.messages[offset..].to_vec(), last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_after_last_is_empty() {
        let mut h = InMemoryHistory::new("s", None, ProtocolVersion::current(), "a");
        assert_eq!(h.get_batch(0), (Vec::new(), 0));

        let msg = Message::chat(1, "hi").unwrap();
        h.add_message(msg.clone()).unwrap();
        assert_eq!(h.get_batch(0), (vec![msg], 1));
        assert_eq!(h.get_batch(1), (Vec::new(), 1));
    }
}
