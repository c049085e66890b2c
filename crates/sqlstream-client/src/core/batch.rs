use bytes::{Bytes, BytesMut};

use crate::{
    core::{
        config::ChecksumValidator,
        wire::{decode_rows, PartialResultSet, Value},
    },
    error::{ClientError, ClientResult},
};

/// Values released by a resume token. Everything in here is final.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub resume_token: Bytes,
    pub values: Vec<Value>,
}

/// Buffers batch bytes until their checksum arrives, then holds the validated
/// values until a resume token releases them.
pub struct BatchAccumulator {
    pending: Vec<Bytes>,
    validated: Vec<Value>,
    validator: ChecksumValidator,
}

impl BatchAccumulator {
    pub fn new(validator: ChecksumValidator) -> Self {
        Self {
            pending: Vec::new(),
            validated: Vec::new(),
            validator,
        }
    }

    /// True when nothing has been received since the last checkpoint.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.validated.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.validated.clear();
    }

    /// Feeds one message. Fields are handled in order: reset, data, checksum,
    /// resume token.
    pub fn push(&mut self, msg: PartialResultSet, column_count: usize) -> ClientResult<Option<Checkpoint>> {
        let mut handled = false;
        let has_token = msg.has_resume_token();

        if msg.reset {
            self.clear();
            handled = true;
        }

        if !msg.batch_data.is_empty() {
            self.pending.push(msg.batch_data);
            handled = true;
        }

        if let Some(checksum) = msg.batch_checksum {
            self.complete_batch(checksum, column_count)?;
            handled = true;
        }

        let mut checkpoint = None;
        if has_token {
            if !self.pending.is_empty() {
                return Err(ClientError::ProtocolStructure(
                    "received resume token before the current batch was completed".into(),
                ));
            }
            checkpoint = Some(Checkpoint {
                resume_token: msg.resume_token,
                values: std::mem::take(&mut self.validated),
            });
            handled = true;
        }

        if !handled {
            return Err(ClientError::ProtocolStructure(
                "response did not contain any results".into(),
            ));
        }
        Ok(checkpoint)
    }

    fn complete_batch(&mut self, checksum: u32, column_count: usize) -> ClientResult<()> {
        if self.pending.is_empty() {
            return Err(ClientError::ProtocolStructure(
                "received empty batch with a checksum".into(),
            ));
        }

        let batch = if self.pending.len() == 1 {
            self.pending.remove(0)
        } else {
            let mut buf = BytesMut::with_capacity(self.pending.iter().map(Bytes::len).sum());
            for chunk in self.pending.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };

        if !(self.validator)(&batch, checksum) {
            return Err(ClientError::Checksum);
        }

        let values = decode_rows(&batch)?;
        if column_count == 0 || values.len() % column_count != 0 {
            return Err(ClientError::ProtocolStructure(format!(
                "received incomplete row: {} values for {} columns",
                values.len(),
                column_count
            )));
        }
        self.validated.extend(values);
        Ok(())
    }
}
