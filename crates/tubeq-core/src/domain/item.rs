use std::borrow::Cow;

use super::JobId;

/// One reserved unit of work, as seen by the processor.
///
/// The connection that reserved it and the acknowledgment channel stay with
/// the dispatch loop; the processor only gets the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    id: JobId,
    tube: String,
    body: Vec<u8>,
}

impl Item {
    pub fn new(id: JobId, tube: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            tube: tube.into(),
            body: body.into(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body rendered for logs (invalid UTF-8 is replaced).
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
