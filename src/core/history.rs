use crate::domain::model::HistoryEntry;
use crate::domain::ports::KeyValueStore;
use crate::utils::error::Result;

pub const HISTORY_KEY: &str = "baziHistory";
pub const HISTORY_CAPACITY: usize = 5;

/// 最近提交的出生資料，依姓名去重、新的在前，最多保留 5 筆
pub struct HistoryCache<S: KeyValueStore> {
    store: S,
    entries: Vec<HistoryEntry>,
}

impl<S: KeyValueStore> HistoryCache<S> {
    /// 啟動時讀取一次；資料損毀視為沒有歷史記錄
    pub async fn load(store: S) -> Self {
        let entries = match store.load(HISTORY_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                Ok(mut entries) => {
                    entries.truncate(HISTORY_CAPACITY);
                    entries
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed history data: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Could not read history: {}", e);
                Vec::new()
            }
        };

        tracing::debug!("Loaded {} history entries", entries.len());
        Self { store, entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    /// 放到最前面並移除同名舊記錄，再寫回存放區。
    /// 寫入失敗時記憶體中的列表仍然更新。
    pub async fn record(&mut self, entry: HistoryEntry) -> Result<()> {
        self.entries.retain(|existing| existing.name != entry.name);
        self.entries.insert(0, entry);
        self.entries.truncate(HISTORY_CAPACITY);

        let serialized = serde_json::to_string(&self.entries)?;
        self.store.save(HISTORY_KEY, &serialized).await
    }
}
