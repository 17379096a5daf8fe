use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    Arc,
};

use tokio::sync::Mutex;

use crate::{
    events::{self, Event, EventBus, EventData, EventPriority},
    metainfo::FileInfo,
    ID,
};

pub type Result<T> = std::result::Result<T, SelectionError>;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {

    #[error("unknown file index {0}")]
    UnknownFile(usize),

    // Padding exists only to align pieces; it cannot be selected.
    #[error("file {0} is a padding file")]
    PaddingFile(usize),

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FilePriority {
    DoNotDownload = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Maximum = 4,
}

impl FilePriority {

    pub fn numeric(self) -> u8 { self as u8 }

    fn from_numeric(v: u8) -> Self {
        match v {
            0 => FilePriority::DoNotDownload,
            1 => FilePriority::Low,
            3 => FilePriority::High,
            4 => FilePriority::Maximum,
            _ => FilePriority::Normal,
        }
    }
}

// One file's byte range within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceFileSpan {

    pub file_index: usize,

    // Offset within the file, not within the torrent.
    pub file_offset: u64,

    pub length: u64,

}

// Bidirectional piece <-> file mapping over the torrent's byte stream.
// Built once when metadata is known, never mutated after. Padding files
// occupy offsets but contribute no spans.
#[derive(Debug)]
pub struct PieceFileMap {

    piece_length: u32,

    total_length: u64,

    piece_spans: Vec<Vec<PieceFileSpan>>,

    // Ascending piece indices per file; empty for padding files.
    file_pieces: Vec<Vec<u32>>,

}

impl PieceFileMap {

    pub fn build(files: &[FileInfo], piece_length: u32) -> Self {

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let num_pieces = if total_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length as u64)
        } as usize;

        let mut piece_spans: Vec<Vec<PieceFileSpan>> = vec![Vec::new(); num_pieces];
        let mut file_pieces: Vec<Vec<u32>> = vec![Vec::new(); files.len()];

        for piece in 0..num_pieces {
            let piece_start = piece as u64 * piece_length as u64;
            let piece_end = (piece_start + piece_length as u64).min(total_length);

            for file in files {
                if file.is_padding || file.length == 0 {
                    continue;
                }
                let file_start = file.offset;
                let file_end = file.offset + file.length;

                let overlap_start = piece_start.max(file_start);
                let overlap_end = piece_end.min(file_end);
                if overlap_start < overlap_end {
                    piece_spans[piece].push(PieceFileSpan {
                        file_index: file.index,
                        file_offset: overlap_start - file_start,
                        length: overlap_end - overlap_start,
                    });
                    file_pieces[file.index].push(piece as u32);
                }
            }
        }

        Self {
            piece_length,
            total_length,
            piece_spans,
            file_pieces,
        }
    }

    pub fn num_pieces(&self) -> u32 { self.piece_spans.len() as u32 }

    pub fn piece_length(&self) -> u32 { self.piece_length }

    pub fn total_length(&self) -> u64 { self.total_length }

    pub fn spans_for_piece(&self, piece: u32) -> &[PieceFileSpan] {
        self.piece_spans
            .get(piece as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pieces_for_file(&self, file_index: usize) -> &[u32] {
        self.file_pieces
            .get(file_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct FileState {

    pub index: usize,

    pub length: u64,

    pub is_padding: bool,

    pub path: std::path::PathBuf,

    pub selected: bool,

    pub priority: FilePriority,

    pub bytes_downloaded: u64,

}

impl FileState {

    pub fn progress(&self) -> f64 {
        if self.length == 0 {
            1.0
        } else {
            self.bytes_downloaded as f64 / self.length as f64
        }
    }
}

// Selection and priority state per file. Mutations serialize on one async
// mutex; the derived piece queries read lock-free mirrors so the piece
// picker can call them from anywhere.
pub struct FileSelectionManager {

    info_hash: ID,

    map: Arc<PieceFileMap>,

    files: Mutex<Vec<FileState>>,

    selected: Vec<AtomicBool>,

    priorities: Vec<AtomicU8>,

    downloaded: Vec<AtomicU64>,

    events: EventBus,

}

impl FileSelectionManager {

    pub fn new(info_hash: ID, files: &[FileInfo], piece_length: u32, events: EventBus) -> Self {

        let map = Arc::new(PieceFileMap::build(files, piece_length));

        let states: Vec<FileState> = files
            .iter()
            .map(|f| FileState {
                index: f.index,
                length: f.length,
                is_padding: f.is_padding,
                path: f.path.clone(),
                // Non-padding files start selected; padding never is.
                selected: !f.is_padding,
                priority: if f.is_padding {
                    FilePriority::DoNotDownload
                } else {
                    FilePriority::Normal
                },
                bytes_downloaded: 0,
            })
            .collect();

        let selected = states.iter().map(|s| AtomicBool::new(s.selected)).collect();
        let priorities = states
            .iter()
            .map(|s| AtomicU8::new(s.priority.numeric()))
            .collect();
        let downloaded = states.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            info_hash,
            map,
            files: Mutex::new(states),
            selected,
            priorities,
            downloaded,
            events,
        }
    }

    pub fn map(&self) -> Arc<PieceFileMap> { self.map.clone() }

    pub async fn select(&self, file_index: usize) -> Result<()> {
        self.set_selected(file_index, true).await
    }

    pub async fn deselect(&self, file_index: usize) -> Result<()> {
        self.set_selected(file_index, false).await
    }

    pub async fn select_many(&self, file_indices: &[usize]) -> Result<()> {
        for &index in file_indices {
            self.set_selected(index, true).await?;
        }
        Ok(())
    }

    pub async fn deselect_many(&self, file_indices: &[usize]) -> Result<()> {
        for &index in file_indices {
            self.set_selected(index, false).await?;
        }
        Ok(())
    }

    pub async fn select_all(&self) {
        let indices: Vec<usize> = {
            let files = self.files.lock().await;
            files.iter().filter(|f| !f.is_padding).map(|f| f.index).collect()
        };
        for index in indices {
            // Non-padding indices cannot fail.
            let _ = self.set_selected(index, true).await;
        }
    }

    pub async fn deselect_all(&self) {
        let indices: Vec<usize> = {
            let files = self.files.lock().await;
            files.iter().filter(|f| !f.is_padding).map(|f| f.index).collect()
        };
        for index in indices {
            let _ = self.set_selected(index, false).await;
        }
    }

    async fn set_selected(&self, file_index: usize, selected: bool) -> Result<()> {

        let mut files = self.files.lock().await;
        let state = files
            .get_mut(file_index)
            .ok_or(SelectionError::UnknownFile(file_index))?;
        if state.is_padding {
            return Err(SelectionError::PaddingFile(file_index));
        }
        if state.selected == selected {
            return Ok(());
        }
        state.selected = selected;
        self.selected[file_index].store(selected, Ordering::Release);
        drop(files);

        self.events
            .emit(Event::new(
                events::types::FILE_SELECTION_CHANGED,
                EventPriority::Normal,
                EventData::FileSelectionChanged {
                    info_hash: self.info_hash,
                    file_index,
                    selected,
                },
            ))
            .await;
        Ok(())
    }

    pub async fn set_priority(&self, file_index: usize, priority: FilePriority) -> Result<()> {

        let mut files = self.files.lock().await;
        let state = files
            .get_mut(file_index)
            .ok_or(SelectionError::UnknownFile(file_index))?;
        if state.is_padding {
            return Err(SelectionError::PaddingFile(file_index));
        }
        if state.priority == priority {
            return Ok(());
        }
        state.priority = priority;
        self.priorities[file_index].store(priority.numeric(), Ordering::Release);
        drop(files);

        self.events
            .emit(Event::new(
                events::types::FILE_PRIORITY_CHANGED,
                EventPriority::Normal,
                EventData::FilePriorityChanged {
                    info_hash: self.info_hash,
                    file_index,
                    priority: priority.numeric(),
                },
            ))
            .await;
        Ok(())
    }

    pub async fn update_progress(&self, file_index: usize, bytes_downloaded: u64) -> Result<()> {
        let mut files = self.files.lock().await;
        let state = files
            .get_mut(file_index)
            .ok_or(SelectionError::UnknownFile(file_index))?;
        state.bytes_downloaded = bytes_downloaded.min(state.length);
        self.downloaded[file_index].store(state.bytes_downloaded, Ordering::Release);
        Ok(())
    }

    // Lock-free derived queries for the piece picker.

    pub fn is_file_selected(&self, file_index: usize) -> bool {
        self.selected
            .get(file_index)
            .is_some_and(|s| s.load(Ordering::Acquire))
    }

    pub fn is_piece_needed(&self, piece: u32) -> bool {
        self.map
            .spans_for_piece(piece)
            .iter()
            .any(|span| self.is_file_selected(span.file_index))
    }

    // Highest priority among selected files overlapping the piece; 0 when
    // nothing selected wants it.
    pub fn piece_priority(&self, piece: u32) -> u8 {
        self.map
            .spans_for_piece(piece)
            .iter()
            .filter(|span| self.is_file_selected(span.file_index))
            .map(|span| self.priorities[span.file_index].load(Ordering::Acquire))
            .max()
            .unwrap_or(0)
    }

    pub fn file_priority(&self, file_index: usize) -> FilePriority {
        FilePriority::from_numeric(
            self.priorities
                .get(file_index)
                .map(|p| p.load(Ordering::Acquire))
                .unwrap_or(0),
        )
    }

    // Total bytes the current selection will download; padding never counts.
    pub async fn selected_bytes(&self) -> u64 {
        let files = self.files.lock().await;
        files
            .iter()
            .filter(|f| f.selected && !f.is_padding)
            .map(|f| f.length)
            .sum()
    }

    pub async fn file_states(&self) -> Vec<FileState> {
        self.files.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use std::path::PathBuf;

    fn file(index: usize, length: u64, offset: u64, is_padding: bool) -> FileInfo {
        FileInfo {
            index,
            path: PathBuf::from(format!("f{}", index)),
            length,
            offset,
            is_padding,
        }
    }

    // Multi-file layout from a 16 KiB-piece torrent: A=10k, pad=6k (aligns
    // B to piece 1), B=16k, C=32k.
    fn aligned_files() -> Vec<FileInfo> {
        vec![
            file(0, 10_240, 0, false),
            file(1, 6_144, 10_240, true),
            file(2, 16_384, 16_384, false),
            file(3, 32_768, 32_768, false),
        ]
    }

    fn manager(files: &[FileInfo]) -> FileSelectionManager {
        FileSelectionManager::new([7; 20], files, 16_384, EventBus::new(EventBusConfig::default()))
    }

    #[test]
    fn map_aligns_pieces_to_file_boundaries() {
        let map = PieceFileMap::build(&aligned_files(), 16_384);
        assert_eq!(map.num_pieces(), 4);

        // Piece 0 is file A plus padding slack; only A contributes a span.
        let spans = map.spans_for_piece(0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].file_index, 0);
        assert_eq!(spans[0].file_offset, 0);
        assert_eq!(spans[0].length, 10_240);

        // Piece 1 starts exactly at file B.
        let spans = map.spans_for_piece(1);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].file_index, 2);
        assert_eq!(spans[0].file_offset, 0);
        assert_eq!(spans[0].length, 16_384);

        // Padding owns no pieces; C owns the last two.
        assert!(map.pieces_for_file(1).is_empty());
        assert_eq!(map.pieces_for_file(3), &[2, 3]);
    }

    #[test]
    fn map_splits_pieces_across_files() {
        // No padding: B straddles the piece boundary.
        let files = vec![
            file(0, 10_000, 0, false),
            file(1, 20_000, 10_000, false),
        ];
        let map = PieceFileMap::build(&files, 16_384);
        let spans = map.spans_for_piece(0);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].file_index, 0);
        assert_eq!(spans[0].length, 10_000);
        assert_eq!(spans[1].file_index, 1);
        assert_eq!(spans[1].file_offset, 0);
        assert_eq!(spans[1].length, 6_384);

        // Reverse map is ascending.
        assert_eq!(map.pieces_for_file(1), &[0, 1]);
    }

    #[tokio::test]
    async fn padding_never_selected() {
        let mgr = manager(&aligned_files());
        assert!(!mgr.is_file_selected(1));
        assert!(matches!(mgr.select(1).await, Err(SelectionError::PaddingFile(1))));
        mgr.select_all().await;
        assert!(!mgr.is_file_selected(1));
        assert_eq!(mgr.selected_bytes().await, 10_240 + 16_384 + 32_768);
    }

    #[tokio::test]
    async fn deselect_makes_exclusive_pieces_unneeded() {
        let mgr = manager(&aligned_files());
        assert!(mgr.is_piece_needed(0));

        mgr.deselect(0).await.unwrap();
        // Piece 0 contained only file A bytes (plus padding).
        assert!(!mgr.is_piece_needed(0));
        assert!(mgr.is_piece_needed(1));
        assert_eq!(mgr.piece_priority(0), 0);
    }

    #[tokio::test]
    async fn piece_priority_is_max_of_selected_files() {
        let files = vec![
            file(0, 10_000, 0, false),
            file(1, 20_000, 10_000, false),
        ];
        let mgr = manager(&files);
        mgr.set_priority(0, FilePriority::Low).await.unwrap();
        mgr.set_priority(1, FilePriority::High).await.unwrap();
        // Piece 0 overlaps both.
        assert_eq!(mgr.piece_priority(0), FilePriority::High.numeric());

        mgr.deselect(1).await.unwrap();
        assert_eq!(mgr.piece_priority(0), FilePriority::Low.numeric());
    }

    #[tokio::test]
    async fn selection_mutations_emit_events() {
        let bus = EventBus::new(EventBusConfig::default());
        let mgr = FileSelectionManager::new([7; 20], &aligned_files(), 16_384, bus.clone());

        mgr.deselect(0).await.unwrap();
        mgr.set_priority(2, FilePriority::Maximum).await.unwrap();

        let selection_events = bus.get_replay_events(Some(events::types::FILE_SELECTION_CHANGED), 10);
        assert_eq!(selection_events.len(), 1);
        let priority_events = bus.get_replay_events(Some(events::types::FILE_PRIORITY_CHANGED), 10);
        assert_eq!(priority_events.len(), 1);
    }

    #[tokio::test]
    async fn unknown_file_is_an_error() {
        let mgr = manager(&aligned_files());
        assert!(matches!(mgr.select(99).await, Err(SelectionError::UnknownFile(99))));
    }

    #[tokio::test]
    async fn progress_updates_clamp_to_length() {
        let mgr = manager(&aligned_files());
        mgr.update_progress(0, 1_000_000).await.unwrap();
        let states = mgr.file_states().await;
        assert_eq!(states[0].bytes_downloaded, 10_240);
        assert!((states[0].progress() - 1.0).abs() < f64::EPSILON);
    }
}
