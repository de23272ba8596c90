use anyhow::Context;
use ckb_merkle_mountain_range::{util::MemStore, Merge, MerkleProof, MMR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::record::ReportSeal;

/// 模块：完整性账本 (Integrity Ledger)
///
/// **职责**: 按时间顺序记录每一份报告封条的指纹，并提供不可篡改的存在性证明。
///
/// 使用 Merkle Mountain Range：
/// - 只追加，不修改历史；
/// - Root 只依赖各座"山峰"的顶点，追加是 O(log n)；
/// - 任意一条记录都可以开具包含性证明，审计方拿着 Root 即可独立验证。
///
/// 账本可以绑定一个 JSON 文件 (`open`)，每次追加后落盘，下次启动从文件恢复。

/// 合并策略：父节点 = blake3(左 || 右)
pub struct MergeBlake3;

impl Merge for MergeBlake3 {
    type Item = [u8; 32];

    fn merge(lhs: &Self::Item, rhs: &Self::Item) -> ckb_merkle_mountain_range::Result<Self::Item> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lhs);
        hasher.update(rhs);
        Ok(*hasher.finalize().as_bytes())
    }
}

pub type SealProof = MerkleProof<[u8; 32], MergeBlake3>;

/// 封条的叶子哈希
pub fn leaf_hash(seal: &ReportSeal) -> anyhow::Result<[u8; 32]> {
    let payload = serde_json::to_vec(seal)?;
    Ok(*blake3::hash(&payload).as_bytes())
}

/// 落盘格式：只存叶子，内部节点在加载时重新计算，
/// `mmr_size` 与 `root` 用来核对重建结果
#[derive(Serialize, Deserialize)]
struct LedgerFile {
    mmr_size: u64,
    root: Option<String>,
    leaves: Vec<String>,
}

pub struct IntegrityLedger {
    store: MemStore<[u8; 32]>,
    /// MMR 的节点总数，是定位山峰的坐标系，丢了它就无法解读存储中的哈希
    mmr_size: u64,
    leaves: Vec<[u8; 32]>,
    /// 为 None 时是纯内存账本
    path: Option<PathBuf>,
}

impl IntegrityLedger {
    /// 纯内存账本，进程退出即丢失
    pub fn new() -> Self {
        Self {
            store: MemStore::default(),
            mmr_size: 0,
            leaves: Vec::new(),
            path: None,
        }
    }

    /// 打开 (或新建) 绑定到文件的账本
    ///
    /// 文件存在时逐个重放叶子重建 MMR，重建出的 `mmr_size` 或 Root 与文件记录不一致即拒绝打开。
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut ledger = Self::new();

        if path.exists() {
            let raw = std::fs::read(path).with_context(|| format!("reading ledger {}", path.display()))?;
            let file: LedgerFile =
                serde_json::from_slice(&raw).with_context(|| format!("parsing ledger {}", path.display()))?;

            for (i, leaf) in file.leaves.iter().enumerate() {
                let leaf = decode_hash(leaf).with_context(|| format!("ledger leaf #{i}"))?;
                let (_, _, mmr_size) = ledger.push_leaf(leaf)?;
                ledger.advance(leaf, mmr_size);
            }
            anyhow::ensure!(
                ledger.mmr_size == file.mmr_size,
                "ledger {} is corrupt: {} leaves rebuild to mmr_size {}, file says {}",
                path.display(),
                ledger.leaves.len(),
                ledger.mmr_size,
                file.mmr_size
            );
            let root = if ledger.is_empty() { None } else { Some(hex::encode(ledger.root()?)) };
            anyhow::ensure!(
                root == file.root,
                "ledger {} is corrupt: rebuilt root does not match the recorded root",
                path.display()
            );
            tracing::info!(path = %path.display(), leaves = ledger.len(), "📒 账本已恢复");
        } else {
            tracing::info!(path = %path.display(), "📒 新建账本");
        }

        ledger.path = Some(path.to_path_buf());
        Ok(ledger)
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// 追加一条封条，返回 (新的 Root, 叶子位置)
    ///
    /// 绑定了文件时先落盘再生效：写文件失败则账本保持追加前的状态。
    pub fn append(&mut self, seal: &ReportSeal) -> anyhow::Result<([u8; 32], u64)> {
        let leaf = leaf_hash(seal)?;
        let (pos, root, mmr_size) = self.push_leaf(leaf)?;

        if let Some(path) = &self.path {
            let mut leaves = self.leaves.clone();
            leaves.push(leaf);
            persist(path, mmr_size, root, &leaves)?;
        }

        self.advance(leaf, mmr_size);
        tracing::info!(pos, root = %hex::encode(root), "⛓️ 报告封条已入账");
        Ok((root, pos))
    }

    /// 把叶子写进存储，返回 (叶子位置, 新 Root, 新 mmr_size)
    ///
    /// 新节点都落在当前 `mmr_size` 之后，在 `advance` 之前对读取不可见，
    /// 下一次 push 会直接覆盖它们。
    fn push_leaf(&self, leaf: [u8; 32]) -> anyhow::Result<(u64, [u8; 32], u64)> {
        let mut mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        let pos = mmr
            .push(leaf)
            .map_err(|e| anyhow::anyhow!("MMR append error: {}", e))?;
        let root = mmr
            .get_root()
            .map_err(|e| anyhow::anyhow!("MMR get_root error: {}", e))?;
        let mmr_size = mmr.mmr_size();
        // push 只写入批次缓冲，commit 之后才真正落到 store
        mmr.commit()
            .map_err(|e| anyhow::anyhow!("MMR commit error: {}", e))?;
        Ok((pos, root, mmr_size))
    }

    fn advance(&mut self, leaf: [u8; 32], mmr_size: u64) {
        self.leaves.push(leaf);
        self.mmr_size = mmr_size;
    }

    pub fn root(&self) -> anyhow::Result<[u8; 32]> {
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        mmr.get_root()
            .map_err(|e| anyhow::anyhow!("MMR get_root error: {}", e))
    }

    /// 为指定位置开具包含性证明
    pub fn proof(&self, pos: u64) -> anyhow::Result<SealProof> {
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        mmr.gen_proof(vec![pos])
            .map_err(|e| anyhow::anyhow!("MMR gen_proof error: {}", e))
    }

    /// 审计方的验证流程：用封条重算叶子哈希，再沿证明路径回放到 Root
    pub fn verify_inclusion(root: [u8; 32], pos: u64, seal: &ReportSeal, proof: SealProof) -> anyhow::Result<bool> {
        let leaf = leaf_hash(seal)?;
        proof
            .verify(root, vec![(pos, leaf)])
            .map_err(|e| anyhow::anyhow!("MMR verify error: {}", e))
    }
}

impl Default for IntegrityLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_hash(text: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(text)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", b.len()))
}

/// 先写临时文件再改名，进程中途退出不会留下半截账本
fn persist(path: &Path, mmr_size: u64, root: [u8; 32], leaves: &[[u8; 32]]) -> anyhow::Result<()> {
    let file = LedgerFile {
        mmr_size,
        root: Some(hex::encode(root)),
        leaves: leaves.iter().map(hex::encode).collect(),
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)
        .with_context(|| format!("writing ledger {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing ledger {}", path.display()))?;
    Ok(())
}
