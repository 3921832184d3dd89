use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use swing_protocol::VatId;

use super::{Transcript, TranscriptEntry, TranscriptError, TranscriptHeader, TranscriptStore};

const TRANSCRIPT_DIR: &str = "transcripts";

/// Filesystem transcripts: one newline-delimited JSON file per vat, header
/// first. Earlier incarnations are kept as `<vat>.<incarnation>.ndjson`.
#[derive(Debug)]
pub struct FsTranscriptStore {
    dir: PathBuf,
    next_pos: HashMap<VatId, u64>,
}

impl FsTranscriptStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, TranscriptError> {
        let dir = root.as_ref().join(TRANSCRIPT_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_pos: HashMap::new(),
        })
    }

    pub fn path(&self, vat_id: &VatId) -> PathBuf {
        self.dir.join(format!("{}.ndjson", vat_id.as_str()))
    }

    fn archive_path(&self, vat_id: &VatId, incarnation: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{incarnation}.ndjson", vat_id.as_str()))
    }
}

impl TranscriptStore for FsTranscriptStore {
    fn start(&mut self, header: TranscriptHeader) -> Result<(), TranscriptError> {
        header.check()?;
        let path = self.path(&header.vat_id);
        if path.exists() {
            let previous = read_transcript(&path)?;
            let archive = self.archive_path(&header.vat_id, previous.header.incarnation);
            fs::rename(&path, archive)?;
        }
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');
        let mut file = File::create(&path)?;
        file.write_all(&line)?;
        file.sync_all()?;
        self.next_pos.insert(header.vat_id, 0);
        Ok(())
    }

    fn append(&mut self, vat_id: &VatId, entry: &TranscriptEntry) -> Result<u64, TranscriptError> {
        let path = self.path(vat_id);
        let pos = match self.next_pos.get(vat_id) {
            Some(pos) => *pos,
            None => match self.load(vat_id)? {
                Some(transcript) => transcript.entries.len() as u64,
                None => return Err(TranscriptError::UnknownVat(vat_id.clone())),
            },
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&line)?;
        file.sync_all()?;
        self.next_pos.insert(vat_id.clone(), pos + 1);
        Ok(pos)
    }

    fn load(&self, vat_id: &VatId) -> Result<Option<Transcript>, TranscriptError> {
        let path = self.path(vat_id);
        match read_transcript(&path) {
            Ok(transcript) => Ok(Some(transcript)),
            Err(TranscriptError::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove(&mut self, vat_id: &VatId) -> Result<(), TranscriptError> {
        self.next_pos.remove(vat_id);
        match fs::remove_file(self.path(vat_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_transcript(path: &Path) -> Result<Transcript, TranscriptError> {
    let text = fs::read_to_string(path)?;
    if text.is_empty() {
        return Err(TranscriptError::Corrupt("empty transcript".into()));
    }
    if !text.ends_with('\n') {
        return Err(TranscriptError::Corrupt("torn final line".into()));
    }
    let mut lines = text.lines();
    let first = lines
        .next()
        .ok_or_else(|| TranscriptError::Corrupt("missing header".into()))?;
    let header: TranscriptHeader = serde_json::from_str(first)
        .map_err(|err| TranscriptError::Corrupt(format!("header: {err}")))?;
    header.check()?;
    let entries = lines
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str::<TranscriptEntry>(line)
                .map_err(|err| TranscriptError::Corrupt(format!("entry {idx}: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Transcript { header, entries })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use swing_protocol::{CapData, VatDeliveryObject, VatDeliveryResult, VatSyscallObject, VatSyscallResult};
    use tempfile::TempDir;

    use super::*;

    fn header(vat: &VatId, incarnation: u64) -> TranscriptHeader {
        TranscriptHeader::new(
            vat.clone(),
            incarnation,
            CapData::new("#{}", vec![]),
            json!({"moduleFormat": "native", "entry": "counter", "modules": {}}),
        )
    }

    fn entry() -> TranscriptEntry {
        let mut entry = TranscriptEntry::new(&VatDeliveryObject::BringOutYourDead);
        entry.record_syscall(
            &VatSyscallObject::VatstoreGet("n".into()),
            &VatSyscallResult::Ok(json!("2")),
        );
        entry.finish(&VatDeliveryResult::ok());
        entry
    }

    #[test]
    fn writes_and_recovers_entries() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(3);
        let mut store = FsTranscriptStore::open(tmp.path()).unwrap();
        store.start(header(&vat, 0)).unwrap();
        assert_eq!(store.append(&vat, &entry()).unwrap(), 0);
        assert_eq!(store.append(&vat, &entry()).unwrap(), 1);

        let mut again = FsTranscriptStore::open(tmp.path()).unwrap();
        let transcript = again.load(&vat).unwrap().unwrap();
        assert_eq!(transcript.header, header(&vat, 0));
        assert_eq!(transcript.entries, vec![entry(), entry()]);
        assert_eq!(again.append(&vat, &entry()).unwrap(), 2);

        let first_line = fs::read_to_string(again.path(&vat)).unwrap();
        let first: serde_json::Value =
            serde_json::from_str(first_line.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "create-vat");
        assert_eq!(first["vatID"], "v3");
    }

    #[test]
    fn detects_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(1);
        let mut store = FsTranscriptStore::open(tmp.path()).unwrap();
        store.start(header(&vat, 0)).unwrap();
        store.append(&vat, &entry()).unwrap();

        let path = store.path(&vat);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let err = store.load(&vat).unwrap_err();
        assert!(matches!(err, TranscriptError::Corrupt(_)));
    }

    #[test]
    fn new_incarnation_archives_the_old_one() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(4);
        let mut store = FsTranscriptStore::open(tmp.path()).unwrap();
        store.start(header(&vat, 0)).unwrap();
        store.append(&vat, &entry()).unwrap();
        store.start(header(&vat, 1)).unwrap();

        let current = store.load(&vat).unwrap().unwrap();
        assert_eq!(current.header.incarnation, 1);
        assert!(current.entries.is_empty());
        assert!(store.archive_path(&vat, 0).exists());

        store.remove(&vat).unwrap();
        assert!(store.load(&vat).unwrap().is_none());
    }
}
