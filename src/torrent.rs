//! BitTorrent v2 (BEP 52) metainfo generation for large layers.
//!
//! The file is hashed in 16 KiB blocks into a SHA-256 merkle tree.  The
//! metainfo carries the tree root per file and the piece layer (the tree
//! level where each node covers one piece).  The bencoded document is
//! written next to the layer as `<file>.torrent` and returned base64-encoded
//! so it can travel through the shared store and the peer RPC surface.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

pub const BLOCK_SIZE: usize = 16 * 1024;
const HASH_LEN: usize = 32;

#[async_trait]
pub trait TorrentGenerator: Send + Sync {
    /// Produce base64-encoded metainfo for the layer `digest` stored at
    /// `path`.
    async fn generate(&self, digest: &str, path: &Path) -> Result<String>;
}

/// Where the metainfo for a layer file is written.
pub fn torrent_path(layer: &Path) -> PathBuf {
    let mut name = layer.as_os_str().to_os_string();
    name.push(".torrent");
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct MetainfoGenerator {
    piece_length: u64,
    announce: Option<String>,
}

impl MetainfoGenerator {
    pub fn new(piece_length: u64, announce: Option<String>) -> Result<Self> {
        anyhow::ensure!(
            piece_length >= BLOCK_SIZE as u64 && piece_length.is_power_of_two(),
            "piece length {piece_length} must be a power of two of at least {BLOCK_SIZE}"
        );
        Ok(Self {
            piece_length,
            announce,
        })
    }

    fn build(&self, path: &Path) -> Result<Vec<u8>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open layer {}", path.display()))?;
        let (length, leaves) = hash_blocks(file)
            .with_context(|| format!("failed to hash layer {}", path.display()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("layer path has no file name")?;

        let mut file_entry = BTreeMap::new();
        file_entry.insert(b"length".to_vec(), Bencode::Int(length as i64));

        let mut piece_layers = BTreeMap::new();
        if length > 0 {
            let tree = MerkleTree::new(leaves, self.blocks_per_piece());
            let root = tree.root();
            debug!(pieces_root = %hex::encode(root), length, "computed merkle root");
            file_entry.insert(b"pieces root".to_vec(), Bencode::Bytes(root.to_vec()));
            if length > self.piece_length {
                let pieces = length.div_ceil(self.piece_length) as usize;
                piece_layers.insert(root.to_vec(), Bencode::Bytes(tree.piece_layer(pieces)));
            }
        }

        let mut leaf = BTreeMap::new();
        leaf.insert(Vec::new(), Bencode::Dict(file_entry));
        let mut file_tree = BTreeMap::new();
        file_tree.insert(name.clone().into_bytes(), Bencode::Dict(leaf));

        let mut info = BTreeMap::new();
        info.insert(b"file tree".to_vec(), Bencode::Dict(file_tree));
        info.insert(b"meta version".to_vec(), Bencode::Int(2));
        info.insert(b"name".to_vec(), Bencode::Bytes(name.into_bytes()));
        info.insert(
            b"piece length".to_vec(),
            Bencode::Int(self.piece_length as i64),
        );

        let mut root = BTreeMap::new();
        if let Some(announce) = &self.announce {
            root.insert(
                b"announce".to_vec(),
                Bencode::Bytes(announce.clone().into_bytes()),
            );
        }
        root.insert(b"created by".to_vec(), Bencode::Bytes(b"pullcache".to_vec()));
        root.insert(
            b"creation date".to_vec(),
            Bencode::Int(chrono::Utc::now().timestamp()),
        );
        root.insert(b"info".to_vec(), Bencode::Dict(info));
        root.insert(b"piece layers".to_vec(), Bencode::Dict(piece_layers));

        let mut out = Vec::new();
        Bencode::Dict(root).encode(&mut out);
        Ok(out)
    }

    fn blocks_per_piece(&self) -> usize {
        (self.piece_length / BLOCK_SIZE as u64) as usize
    }
}

#[async_trait]
impl TorrentGenerator for MetainfoGenerator {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn generate(&self, digest: &str, path: &Path) -> Result<String> {
        let this = self.clone();
        let layer = path.to_path_buf();
        let metainfo = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let metainfo = this.build(&layer)?;
            write_metainfo(&layer, &metainfo)?;
            Ok(metainfo)
        })
        .await
        .context("torrent generation task panicked")??;

        info!(digest, bytes = metainfo.len(), "generated torrent metainfo");
        Ok(base64::engine::general_purpose::STANDARD.encode(metainfo))
    }
}

/// Write `<layer>.torrent` atomically.
fn write_metainfo(layer: &Path, metainfo: &[u8]) -> Result<()> {
    use std::io::Write;

    let dest = torrent_path(layer);
    let dir = dest.parent().context("torrent path has no parent dir")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(metainfo)
        .context("failed to write torrent metainfo")?;
    tmp.persist(&dest)
        .with_context(|| format!("failed to persist {}", dest.display()))?;
    Ok(())
}

/// Hash `reader` in [`BLOCK_SIZE`] blocks.  Returns the byte length and one
/// leaf hash per block (the final block may be short).
fn hash_blocks(mut reader: impl Read) -> std::io::Result<(u64, Vec<[u8; HASH_LEN]>)> {
    let mut leaves = Vec::new();
    let mut length = 0u64;
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match reader.read(&mut block[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }
        length += filled as u64;
        leaves.push(Sha256::digest(&block[..filled]).into());
        if filled < BLOCK_SIZE {
            break;
        }
    }
    Ok((length, leaves))
}

fn hash_pair(left: &[u8; HASH_LEN], right: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle tree over block hashes, padded with zero leaves to a power of two.
/// `levels[0]` holds the leaves and the last level holds the root.
struct MerkleTree {
    levels: Vec<Vec<[u8; HASH_LEN]>>,
    blocks_per_piece: usize,
}

impl MerkleTree {
    fn new(mut leaves: Vec<[u8; HASH_LEN]>, blocks_per_piece: usize) -> Self {
        let width = leaves.len().next_power_of_two().max(1);
        leaves.resize(width, [0u8; HASH_LEN]);

        let mut levels = vec![leaves];
        while let Some(level) = levels.last().filter(|l| l.len() > 1) {
            let next = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }
        Self {
            levels,
            blocks_per_piece,
        }
    }

    fn root(&self) -> [u8; HASH_LEN] {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or([0u8; HASH_LEN])
    }

    /// Concatenated hashes of the first `pieces` nodes at piece level.
    fn piece_layer(&self, pieces: usize) -> Vec<u8> {
        let depth = self.blocks_per_piece.trailing_zeros() as usize;
        self.levels
            .get(depth)
            .map(|level| level.iter().take(pieces).flatten().copied().collect())
            .unwrap_or_default()
    }
}

/// Minimal bencode value.  Dict keys are kept sorted as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => encode_bytes(bytes, out),
            Self::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode(out);
                }
                out.push(b'e');
            }
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
