use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use swing_protocol::VatId;

use super::{Transcript, TranscriptEntry, TranscriptError, TranscriptHeader, TranscriptStore};

/// In-memory transcripts for tests and ephemeral kernels. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemTranscriptStore {
    transcripts: Arc<Mutex<HashMap<VatId, Transcript>>>,
}

impl MemTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<VatId, Transcript>>, TranscriptError> {
        self.transcripts
            .lock()
            .map_err(|_| TranscriptError::Corrupt("transcript lock poisoned".into()))
    }
}

impl TranscriptStore for MemTranscriptStore {
    fn start(&mut self, header: TranscriptHeader) -> Result<(), TranscriptError> {
        header.check()?;
        self.lock()?.insert(
            header.vat_id.clone(),
            Transcript {
                header,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    fn append(&mut self, vat_id: &VatId, entry: &TranscriptEntry) -> Result<u64, TranscriptError> {
        let mut guard = self.lock()?;
        let transcript = guard
            .get_mut(vat_id)
            .ok_or_else(|| TranscriptError::UnknownVat(vat_id.clone()))?;
        transcript.entries.push(entry.clone());
        Ok(transcript.entries.len() as u64 - 1)
    }

    fn load(&self, vat_id: &VatId) -> Result<Option<Transcript>, TranscriptError> {
        Ok(self.lock()?.get(vat_id).cloned())
    }

    fn remove(&mut self, vat_id: &VatId) -> Result<(), TranscriptError> {
        self.lock()?.remove(vat_id);
        Ok(())
    }
}
