//! Ranked playlist synchronisation.
//!
//! Pulls the top ranked ScoreSaber leaderboards and writes them out as a
//! Beat Saber playlist (`.bplist`-style JSON). The file on disk is only ever
//! replaced whole: we stage into a temp file next to it and rename over.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_lock::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::rank::{DifficultyValue, LeaderboardInfo, RankClient, RankError};

/// Number of songs requested per sync.
pub const PLAYLIST_SIZE: u32 = 50;

pub const PLAYLIST_TITLE: &str = "ScoreSaber Ranked Maps";
pub const PLAYLIST_AUTHOR: &str = "SaberBot";
pub const PLAYLIST_DESCRIPTION: &str = "Auto-updated top 50 ranked maps from ScoreSaber";

/// Every entry is written with this characteristic.
pub const STANDARD_CHARACTERISTIC: &str = "Standard";

// ---------------------------------------------------------------------------
// File model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(rename = "playlistTitle")]
    pub title: String,
    #[serde(rename = "playlistAuthor")]
    pub author: String,
    #[serde(rename = "playlistDescription")]
    pub description: String,
    pub songs: Vec<PlaylistSong>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSong {
    #[serde(rename = "songName")]
    pub song_name: String,
    #[serde(rename = "levelAuthorName")]
    pub level_author: String,
    pub hash: String,
    pub difficulties: Vec<Difficulty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difficulty {
    pub characteristic: String,
    pub name: String,
}

impl Playlist {
    /// Build the playlist from upstream leaderboards, keeping their order.
    ///
    /// Entries whose hash isn't plain alphanumeric are dropped.
    pub fn from_leaderboards(boards: &[LeaderboardInfo]) -> Self {
        let songs = boards
            .iter()
            .filter_map(|board| {
                let hash = normalize_hash(&board.song_hash);
                if hash.is_none() {
                    warn!(song = %board.song_name, hash = %board.song_hash, "skipping leaderboard with malformed hash");
                }
                Some(PlaylistSong {
                    song_name: board.song_name.clone(),
                    level_author: board.level_author_name.clone(),
                    hash: hash?,
                    difficulties: difficulty_for(board).into_iter().collect(),
                })
            })
            .collect();

        Playlist {
            title: PLAYLIST_TITLE.to_string(),
            author: PLAYLIST_AUTHOR.to_string(),
            description: PLAYLIST_DESCRIPTION.to_string(),
            songs,
        }
    }
}

fn normalize_hash(raw: &str) -> Option<String> {
    let hash = raw.trim();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(hash.to_ascii_uppercase())
}

fn difficulty_for(board: &LeaderboardInfo) -> Option<Difficulty> {
    let name = match &board.difficulty.difficulty {
        DifficultyValue::Code(code) => difficulty_from_code(*code),
        DifficultyValue::Name(name) => normalize_difficulty(name),
    }
    .or_else(|| {
        board
            .difficulty
            .difficulty_raw
            .as_deref()
            .and_then(normalize_difficulty)
    });

    match name {
        Some(name) => Some(Difficulty {
            characteristic: STANDARD_CHARACTERISTIC.to_string(),
            name: name.to_string(),
        }),
        None => {
            warn!(song = %board.song_name, difficulty = ?board.difficulty.difficulty, "unrecognised difficulty");
            None
        }
    }
}

/// ScoreSaber's numeric difficulty codes.
pub fn difficulty_from_code(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("Easy"),
        3 => Some("Normal"),
        5 => Some("Hard"),
        7 => Some("Expert"),
        9 => Some("ExpertPlus"),
        _ => None,
    }
}

/// Map a difficulty name in any of the upstream spellings (`expertplus`,
/// `Expert+`, `_ExpertPlus_SoloStandard`) to the playlist name.
pub fn normalize_difficulty(raw: &str) -> Option<&'static str> {
    // `_ExpertPlus_SoloStandard` carries the name in the first segment.
    let name = raw
        .trim()
        .trim_start_matches('_')
        .split('_')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    match name.as_str() {
        "easy" => Some("Easy"),
        "normal" => Some("Normal"),
        "hard" => Some("Hard"),
        "expert" => Some("Expert"),
        "expertplus" | "expert+" => Some("ExpertPlus"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Synchroniser
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RankError),
    #[error("failed to write playlist: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode playlist: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("a playlist update is already in progress")]
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub song_count: usize,
    pub path: PathBuf,
}

pub type SyncResult = Result<SyncSummary, SyncError>;

/// Owns the playlist file. At most one sync runs at a time; a second caller
/// gets [`SyncError::InProgress`] instead of queueing.
#[derive(Debug)]
pub struct PlaylistSync {
    rank: RankClient,
    path: PathBuf,
    guard: Mutex<()>,
}

impl PlaylistSync {
    pub fn new(rank: RankClient, path: impl Into<PathBuf>) -> Self {
        Self {
            rank,
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name used when the playlist is attached to a message.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "playlist.json".to_string())
    }

    /// Fetch the ranked listing and replace the playlist file.
    ///
    /// On any failure the existing file is left untouched.
    pub async fn synchronize(&self) -> SyncResult {
        let Some(_running) = self.guard.try_lock() else {
            return Err(SyncError::InProgress);
        };

        let boards = self.rank.ranked_leaderboards(1, PLAYLIST_SIZE).await?;
        let playlist = Playlist::from_leaderboards(&boards);
        let bytes = serde_json::to_vec_pretty(&playlist)?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(io::Error::other)??;

        info!(
            songs = playlist.songs.len(),
            path = %self.path.display(),
            "playlist updated"
        );
        Ok(SyncSummary {
            song_count: playlist.songs.len(),
            path: self.path.clone(),
        })
    }

    /// Current playlist bytes, or `None` if no sync has produced one yet.
    pub async fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
