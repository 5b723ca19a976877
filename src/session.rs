/// Protocol data accumulated over the life of one connection.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Host announced by HELO/EHLO
    pub sender_host: Option<String>,
    /// Envelope sender; `None` while no transaction is in progress
    pub mail_from: Option<String>,
    pub recipients: Vec<String>,
    /// Body captured by the last completed DATA
    pub message: Option<Vec<u8>>,
    /// BODY=8BITMIME was given on MAIL FROM
    pub use_utf8: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the current transaction. The HELO/EHLO host is kept.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
        self.use_utf8 = false;
    }

    /// Returns false if the address was already a recipient.
    pub fn add_recipient(&mut self, address: &str) -> bool {
        if self.recipients.iter().any(|r| r == address) {
            return false;
        }
        self.recipients.push(address.to_string());
        true
    }

    pub fn has_transaction(&self) -> bool {
        self.mail_from.is_some() && !self.recipients.is_empty()
    }

    pub fn set_message(&mut self, bytes: Vec<u8>) {
        self.message = Some(bytes);
    }
}
