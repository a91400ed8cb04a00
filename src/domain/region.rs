use crate::utils::error::{LingxunError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const BUNDLED_REGIONS: &str = include_str!("../../data/regions.json");

type NodeId = usize;

#[derive(Debug, Clone)]
struct RegionNode {
    code: String,
    label: String,
    children: Vec<NodeId>,
}

/// 資料檔中的巢狀格式: `[{ "value", "label", "children": [...] }]`
#[derive(Debug, Deserialize)]
struct RawRegion {
    value: String,
    label: String,
    #[serde(default)]
    children: Vec<RawRegion>,
}

/// 省市區靜態資料，攤平成以代碼索引的 arena
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    nodes: Vec<RegionNode>,
    by_code: HashMap<String, NodeId>,
    roots: Vec<NodeId>,
}

impl RegionTable {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: Vec<RawRegion> = serde_json::from_str(content)?;
        let mut table = RegionTable::default();
        for region in raw {
            let id = table.insert(region)?;
            table.roots.push(id);
        }
        tracing::debug!(
            "Loaded region table: {} provinces, {} nodes",
            table.roots.len(),
            table.nodes.len()
        );
        Ok(table)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_json_str(&content)
    }

    /// 內建的小型示範資料集
    pub fn bundled() -> Result<Self> {
        Self::from_json_str(BUNDLED_REGIONS)
    }

    fn insert(&mut self, raw: RawRegion) -> Result<NodeId> {
        if self.by_code.contains_key(&raw.value) {
            return Err(LingxunError::ConfigError {
                message: format!("duplicate region code: {}", raw.value),
            });
        }

        let id = self.nodes.len();
        self.nodes.push(RegionNode {
            code: raw.value.clone(),
            label: raw.label,
            children: Vec::new(),
        });
        self.by_code.insert(raw.value, id);

        for child in raw.children {
            let child_id = self.insert(child)?;
            self.nodes[id].children.push(child_id);
        }
        Ok(id)
    }

    fn lookup(&self, code: &str) -> Option<&RegionNode> {
        self.by_code.get(code).map(|&id| &self.nodes[id])
    }

    pub fn label(&self, code: &str) -> Option<&str> {
        self.lookup(code).map(|node| node.label.as_str())
    }

    /// 代碼不存在時回傳空列表
    fn children_of(&self, code: &str) -> Vec<NodeId> {
        self.lookup(code)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    fn option(&self, id: NodeId) -> RegionOption {
        let node = &self.nodes[id];
        RegionOption {
            code: node.code.clone(),
            label: node.label.clone(),
        }
    }

    pub fn provinces(&self) -> Vec<RegionOption> {
        self.roots.iter().map(|&id| self.option(id)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionOption {
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Province,
    City,
    Area,
}

/// 省 → 市 → 區的連動選擇。上層改變時清空所有下層的選擇與候選列表。
#[derive(Debug, Clone)]
pub struct RegionCascade {
    table: Arc<RegionTable>,
    province: Option<String>,
    city: Option<String>,
    area: Option<String>,
    cities: Vec<NodeId>,
    areas: Vec<NodeId>,
}

impl RegionCascade {
    pub fn new(table: Arc<RegionTable>) -> Self {
        Self {
            table,
            province: None,
            city: None,
            area: None,
            cities: Vec::new(),
            areas: Vec::new(),
        }
    }

    pub fn province(&self) -> Option<&str> {
        self.province.as_deref()
    }

    pub fn city(&self) -> Option<&str> {
        self.city.as_deref()
    }

    pub fn area(&self) -> Option<&str> {
        self.area.as_deref()
    }

    pub fn provinces(&self) -> Vec<RegionOption> {
        self.table.provinces()
    }

    pub fn cities(&self) -> Vec<RegionOption> {
        self.cities.iter().map(|&id| self.table.option(id)).collect()
    }

    pub fn areas(&self) -> Vec<RegionOption> {
        self.areas.iter().map(|&id| self.table.option(id)).collect()
    }

    pub fn select_province(&mut self, code: &str) {
        self.province = (!code.is_empty()).then(|| code.to_string());
        self.cities = self.table.children_of(code);
        if self.cities.is_empty() {
            tracing::debug!("Province '{}' has no known cities", code);
        }
        self.city = None;
        self.area = None;
        self.areas.clear();
    }

    /// 只接受目前市級候選列表中的代碼，回傳是否採用
    pub fn select_city(&mut self, code: &str) -> bool {
        self.area = None;
        self.areas.clear();

        match self.find_candidate(&self.cities, code) {
            Some(id) => {
                self.city = Some(code.to_string());
                self.areas = self.table.nodes[id].children.clone();
                true
            }
            None => {
                tracing::debug!("City '{}' is not a child of the selected province", code);
                self.city = None;
                false
            }
        }
    }

    pub fn select_area(&mut self, code: &str) -> bool {
        match self.find_candidate(&self.areas, code) {
            Some(_) => {
                self.area = Some(code.to_string());
                true
            }
            None => {
                tracing::debug!("Area '{}' is not a child of the selected city", code);
                self.area = None;
                false
            }
        }
    }

    fn find_candidate(&self, candidates: &[NodeId], code: &str) -> Option<NodeId> {
        candidates
            .iter()
            .copied()
            .find(|&id| self.table.nodes[id].code == code)
    }

    pub fn restore(&mut self, province: &str, city: Option<&str>, area: Option<&str>) {
        self.restore_with(province, city, area, |_, _| {});
    }

    /// 分階段回放: 先選省份產生市級候選，再選市、最後選區。
    /// 每個階段完成後都會呼叫 `on_phase`，下游控制項依賴上一層候選列表非空。
    pub fn restore_with<F>(
        &mut self,
        province: &str,
        city: Option<&str>,
        area: Option<&str>,
        mut on_phase: F,
    ) where
        F: FnMut(RestorePhase, &RegionCascade),
    {
        self.select_province(province);
        on_phase(RestorePhase::Province, self);

        let Some(city) = city.filter(|c| !c.is_empty()) else {
            return;
        };
        if !self.select_city(city) {
            tracing::warn!("Could not restore city '{}' under '{}'", city, province);
            return;
        }
        on_phase(RestorePhase::City, self);

        let Some(area) = area.filter(|a| !a.is_empty()) else {
            return;
        };
        if !self.select_area(area) {
            tracing::warn!("Could not restore area '{}' under '{}'", area, city);
            return;
        }
        on_phase(RestorePhase::Area, self);
    }

    /// 三層都選好時回傳 "省/市/區"
    pub fn location_label(&self) -> Option<String> {
        let province = self.table.label(self.province.as_deref()?)?;
        let city = self.table.label(self.city.as_deref()?)?;
        let area = self.table.label(self.area.as_deref()?)?;
        Some(format!("{}/{}/{}", province, city, area))
    }
}
