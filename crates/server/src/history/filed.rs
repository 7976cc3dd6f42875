//! Durable session history.
//!
//! A session is stored as two files in the session directory:
//!
//! - `<id>.session`: an append-only text journal of metadata changes
//! - `<id>.dprec`: the recording, a header followed by serialized messages.
//!   A hard reset starts a new recording (`<id>_r2.dprec`, ...) and records
//!   its name in the journal.
//!
//! Every append is written and synced before it is acknowledged. The
//! recording is indexed in blocks that are loaded into memory on demand.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use scribble_protocol::{Message, MessageType, ProtocolVersion, HEADER_LEN};
use tracing::{debug, warn};

use super::{HistoryCore, HistoryError, JournalEntry, SessionHistory};

/// A block is closed once it grows past this many bytes
const MAX_BLOCK_SIZE: u64 = 0xffff * 10;

const RECORDING_MAGIC: &[u8; 6] = b"DPREC\0";

struct Block {
    start_offset: u64,
    start_seq: u64,
    count: u64,
    end_offset: u64,
    /// Cached messages. Either empty or holding all `count` messages.
    messages: Vec<Message>,
}

impl Block {
    fn new(offset: u64, start_seq: u64) -> Self {
        Self {
            start_offset: offset,
            start_seq,
            count: 0,
            end_offset: offset,
            messages: Vec::new(),
        }
    }

    fn last_seq(&self) -> u64 {
        self.start_seq + self.count - 1
    }

    fn is_cached(&self) -> bool {
        self.messages.len() as u64 == self.count
    }
}

pub struct FiledHistory {
    core: HistoryCore,
    dir: PathBuf,
    journal_path: PathBuf,
    journal: File,
    recording_path: PathBuf,
    recording: File,
    file_count: u32,
    blocks: RefCell<Vec<Block>>,
}

impl FiledHistory {
    pub fn journal_filename(id: &str) -> String {
        format!("{id}.session")
    }

    /// Create a new session in `dir`. Fails if the journal already exists.
    pub fn start_new(
        dir: &Path,
        id: &str,
        alias: Option<String>,
        version: ProtocolVersion,
        founder: &str,
    ) -> Result<Self, HistoryError> {
        let journal_path = dir.join(Self::journal_filename(id));
        let journal = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&journal_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => HistoryError::AlreadyExists(journal_path.clone()),
                _ => HistoryError::Io(e),
            })?;

        let core = HistoryCore::new(id, alias, version, founder);
        let (recording_path, recording, header_len) = match create_recording(dir, id, 1, &core.version) {
            Ok(created) => created,
            Err(e) => {
                let _ = fs::remove_file(&journal_path);
                return Err(e.into());
            }
        };

        let mut history = Self {
            dir: dir.to_path_buf(),
            journal_path,
            journal,
            recording_path,
            recording,
            file_count: 1,
            blocks: RefCell::new(vec![Block::new(header_len, core.first_seq)]),
            core,
        };

        history.write_journal(&JournalEntry::File(history.recording_filename()))?;
        if let Some(alias) = history.core.alias.clone() {
            history.write_journal(&JournalEntry::Alias(alias))?;
        }
        history.write_journal(&JournalEntry::Founder(history.core.founder.clone()))?;

        debug!(
            component = "history",
            event = "history.created",
            session_id = %id,
            path = %history.journal_path.display(),
            "Created session files"
        );
        Ok(history)
    }

    /// Load a session from its journal file
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let invalid = |reason: &str| HistoryError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| scribble_protocol::is_valid_session_id(s))
            .ok_or_else(|| invalid("bad session file name"))?
            .to_string();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let text = fs::read_to_string(path)?;
        let journal = OpenOptions::new().append(true).open(path)?;

        let mut core = HistoryCore::new(&id, None, ProtocolVersion::current(), "");
        let mut recording_name = None;
        let mut file_count = 0;
        for line in text.lines() {
            match JournalEntry::parse(line) {
                Ok(Some(JournalEntry::File(name))) => {
                    recording_name = Some(name);
                    file_count += 1;
                }
                Ok(Some(entry)) => core.apply(&entry),
                Ok(None) => {}
                Err(e) => warn!(
                    component = "history",
                    event = "journal.bad_entry",
                    session_id = %id,
                    error = %e,
                    "Ignoring journal entry"
                ),
            }
        }

        let recording_name = recording_name.ok_or_else(|| invalid("recording file not set"))?;
        let recording_path = dir.join(&recording_name);
        if !recording_path.exists() {
            return Err(invalid(&format!("recording {recording_name} not found")));
        }
        let mut recording = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&recording_path)?;

        let (version, header_len) = read_recording_header(&mut recording)
            .map_err(|e| invalid(&format!("invalid recording header: {e}")))?;
        if !version.is_current() {
            return Err(HistoryError::IncompatibleVersion(version));
        }
        core.version = version;

        let mut history = Self {
            dir,
            journal_path: path.to_path_buf(),
            journal,
            recording_path,
            recording,
            file_count,
            blocks: RefCell::new(Vec::new()),
            core,
        };
        history.scan_blocks(header_len)?;

        let (size, count) = {
            let blocks = history.blocks.get_mut();
            let end = blocks.last().map_or(header_len, |b| b.end_offset);
            (end - header_len, blocks.iter().map(|b| b.count).sum::<u64>())
        };
        history.core.history_loaded(size, count);

        // The first joining client would be expected to upload content the
        // session should already have
        if size == 0 {
            return Err(HistoryError::Empty);
        }

        debug!(
            component = "history",
            event = "history.loaded",
            session_id = %history.core.id,
            messages = count,
            bytes = size,
            "Loaded session"
        );
        Ok(history)
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn recording_path(&self) -> &Path {
        &self.recording_path
    }

    fn recording_filename(&self) -> String {
        self.recording_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn write_journal(&mut self, entry: &JournalEntry) -> io::Result<()> {
        let line = format!("{entry}\n");
        self.journal.write_all(line.as_bytes())?;
        self.journal.sync_data()
    }

    /// Index the recording, starting just past the header
    fn scan_blocks(&mut self, start: u64) -> Result<(), HistoryError> {
        let file_len = self.recording.metadata()?.len();
        let mut blocks = vec![Block::new(start, self.core.first_seq)];
        let mut users = BTreeSet::new();
        let mut truncated_at = None;

        {
            let mut reader = BufReader::new(&self.recording);
            reader.seek(SeekFrom::Start(start))?;
            let mut pos = start;

            while pos < file_len {
                let mut header = [0u8; HEADER_LEN];
                if pos + HEADER_LEN as u64 > file_len {
                    truncated_at = Some(pos);
                    break;
                }
                reader.read_exact(&mut header)?;
                let len = Message::peek_len(&header).unwrap_or(HEADER_LEN) as u64;
                if pos + len > file_len {
                    truncated_at = Some(pos);
                    break;
                }
                reader.seek_relative((len - HEADER_LEN as u64) as i64)?;
                pos += len;

                let Some(block) = blocks.last_mut() else { break };
                block.count += 1;
                block.end_offset = pos;
                if block.end_offset - block.start_offset >= MAX_BLOCK_SIZE {
                    let next = Block::new(pos, block.start_seq + block.count);
                    blocks.push(next);
                }

                match MessageType(header[2]) {
                    MessageType::USER_JOIN => {
                        users.insert(header[3]);
                    }
                    MessageType::USER_LEAVE => {
                        users.remove(&header[3]);
                        self.core.id_queue.reserve(header[3]);
                    }
                    _ => {}
                }
            }
        }

        if let Some(offset) = truncated_at {
            warn!(
                component = "history",
                event = "history.recording_truncated",
                session_id = %self.core.id,
                offset,
                "Recording truncated, dropping partial message"
            );
            self.recording.set_len(offset)?;
        }

        // Nobody can be present in a freshly loaded session
        *self.blocks.get_mut() = blocks;
        for user in users {
            self.append_to_recording(&Message::user_leave(user))?;
            self.core.id_queue.reserve(user);
        }
        self.recording.sync_data()?;
        Ok(())
    }

    /// Write a message and index it. Does not sync.
    fn append_to_recording(&mut self, msg: &Message) -> io::Result<()> {
        self.recording.write_all(&msg.to_bytes())?;

        let blocks = self.blocks.get_mut();
        let Some(block) = blocks.last_mut() else {
            return Ok(());
        };
        let was_cached = block.is_cached();
        block.count += 1;
        block.end_offset += msg.len() as u64;
        if was_cached {
            block.messages.push(msg.clone());
        }
        if block.end_offset - block.start_offset > MAX_BLOCK_SIZE {
            let next = Block::new(block.end_offset, block.start_seq + block.count);
            blocks.push(next);
        }
        Ok(())
    }

    fn dispose(&self, path: &Path) {
        let result = if self.core.archive {
            let mut archived = path.as_os_str().to_owned();
            archived.push(".archived");
            fs::rename(path, archived)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = result {
            warn!(
                component = "history",
                event = "history.dispose_failed",
                session_id = %self.core.id,
                path = %path.display(),
                error = %e,
                "Could not remove session file"
            );
        }
    }
}

impl SessionHistory for FiledHistory {
    fn core(&self) -> &HistoryCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HistoryCore {
        &mut self.core
    }

    fn history_add(&mut self, msg: &Message) -> Result<(), HistoryError> {
        self.append_to_recording(msg)?;
        self.recording.sync_data()?;
        Ok(())
    }

    fn history_reset(&mut self, messages: &[Message], first_seq: u64) -> Result<(), HistoryError> {
        let (path, file, header_len) =
            create_recording(&self.dir, &self.core.id, self.file_count + 1, &self.core.version)?;
        self.file_count += 1;

        let old_path = std::mem::replace(&mut self.recording_path, path);
        self.recording = file;
        *self.blocks.get_mut() = vec![Block::new(header_len, first_seq)];
        self.write_journal(&JournalEntry::File(self.recording_filename()))?;

        // The old recording goes after the new one exists so the names never collide
        self.dispose(&old_path);

        for msg in messages {
            self.append_to_recording(msg)?;
        }
        self.recording.sync_data()?;
        Ok(())
    }

    fn get_batch(&self, after: u64) -> (Vec<Message>, u64) {
        let mut blocks = self.blocks.borrow_mut();
        if blocks.is_empty() {
            return (Vec::new(), after);
        }

        // Find the block holding the message after `after`
        let mut i = blocks.len() - 1;
        while i > 0 {
            let prev = &blocks[i - 1];
            if prev.count == 0 || prev.last_seq() <= after {
                break;
            }
            i -= 1;
        }

        let block = &mut blocks[i];
        let offset = (after + 1).saturating_sub(block.start_seq);
        if offset >= block.count {
            return (Vec::new(), block.last_seq());
        }

        if !block.is_cached() {
            debug!(
                component = "history",
                event = "history.block_load",
                session_id = %self.core.id,
                block = i,
                "Loading history block"
            );
            block.messages.clear();
            if let Err(e) = read_block(&self.recording, block.start_offset, block.count, &mut block.messages) {
                warn!(
                    component = "history",
                    event = "history.block_read_failed",
                    session_id = %self.core.id,
                    block = i,
                    error = %e,
                    "Recording read error"
                );
            }
        }

        let available = block.messages.len() as u64;
        if offset >= available {
            return (Vec::new(), after);
        }
        (
            block.messages[offset as usize..].to_vec(),
            block.start_seq + available - 1,
        )
    }

    fn cleanup_batches(&mut self, before: u64) {
        for block in self.blocks.get_mut().iter_mut() {
            if block.start_seq + block.count > before {
                break;
            }
            if !block.messages.is_empty() {
                block.messages = Vec::new();
            }
        }
    }

    fn persist(&mut self, entry: JournalEntry) -> Result<(), HistoryError> {
        self.write_journal(&entry)?;
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), HistoryError> {
        self.recording.sync_data()?;
        self.journal.sync_data()?;
        self.dispose(&self.recording_path);
        self.dispose(&self.journal_path);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HistoryError> {
        self.recording.sync_data()?;
        self.journal.sync_data()?;
        Ok(())
    }
}

/// Create a fresh recording file with its header
fn create_recording(
    dir: &Path,
    id: &str,
    index: u32,
    version: &ProtocolVersion,
) -> io::Result<(PathBuf, File, u64)> {
    let base = if index > 1 {
        format!("{id}_r{index}")
    } else {
        id.to_string()
    };
    let mut path = dir.join(format!("{base}.dprec"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{base}-{n}.dprec"));
        n += 1;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create_new(true)
        .open(&path)?;

    let metadata = serde_json::json!({ "version": version.to_string() }).to_string();
    let mut header = Vec::with_capacity(RECORDING_MAGIC.len() + 2 + metadata.len());
    header.extend_from_slice(RECORDING_MAGIC);
    header.extend_from_slice(&(metadata.len() as u16).to_be_bytes());
    header.extend_from_slice(metadata.as_bytes());
    file.write_all(&header)?;
    file.sync_data()?;

    Ok((path, file, header.len() as u64))
}

/// Read and validate the recording header. Returns the version and header length.
fn read_recording_header(file: &mut File) -> io::Result<(ProtocolVersion, u64)> {
    let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 6];
    file.read_exact(&mut magic)?;
    if &magic != RECORDING_MAGIC {
        return Err(bad("not a recording"));
    }
    let mut len = [0u8; 2];
    file.read_exact(&mut len)?;
    let len = u16::from_be_bytes(len) as usize;
    let mut metadata = vec![0u8; len];
    file.read_exact(&mut metadata)?;

    let metadata: serde_json::Value =
        serde_json::from_slice(&metadata).map_err(|e| bad(&e.to_string()))?;
    let version = metadata
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad("missing version"))?
        .parse::<ProtocolVersion>()
        .map_err(|e| bad(&e.to_string()))?;

    Ok((version, (RECORDING_MAGIC.len() + 2 + len) as u64))
}

fn read_block(file: &File, offset: u64, count: u64, out: &mut Vec<Message>) -> io::Result<()> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;
    for _ in 0..count {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let msg = Message::new(MessageType(header[2]), header[3], payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        out.push(msg);
    }
    Ok(())
}
