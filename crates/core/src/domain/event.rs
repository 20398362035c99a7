use serde::{Deserialize, Serialize};

use crate::domain::thread::ThreadKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: Option<String>,
    pub url: Option<String>,
}

/// One message delivered by the messaging platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    pub thread_key: ThreadKey,
    pub author: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl InboundEvent {
    pub fn new(
        event_id: impl Into<String>,
        thread_key: ThreadKey,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            thread_key,
            author: author.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    /// Text handed to the model: the message body followed by a line per
    /// attachment so the model knows what was shared.
    pub fn prompt_text(&self) -> String {
        if self.attachments.is_empty() {
            return self.text.clone();
        }

        let listing = self
            .attachments
            .iter()
            .map(|attachment| match &attachment.mime_type {
                Some(mime) => format!("[attachment: {} ({mime})]", attachment.name),
                None => format!("[attachment: {}]", attachment.name),
            })
            .collect::<Vec<_>>()
            .join("\n");

        if self.text.trim().is_empty() {
            listing
        } else {
            format!("{}\n\n{listing}", self.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Attachment, InboundEvent};
    use crate::domain::thread::ThreadKey;

    #[test]
    fn prompt_text_lists_attachments_after_body() {
        let mut event = InboundEvent::new("Ev1", ThreadKey::new("C1", "T1"), "U1", "see file");
        event.attachments.push(Attachment {
            name: "report.pdf".to_owned(),
            mime_type: Some("application/pdf".to_owned()),
            url: None,
        });

        assert_eq!(event.prompt_text(), "see file\n\n[attachment: report.pdf (application/pdf)]");
    }

    #[test]
    fn prompt_text_is_plain_body_without_attachments() {
        let event = InboundEvent::new("Ev2", ThreadKey::new("C1", "T1"), "U1", "hello");
        assert_eq!(event.prompt_text(), "hello");
    }
}
