use std::collections::BTreeMap;

use async_trait::async_trait;

use draftq_core::ObjectInfo;

/// Field and relationship metadata, keyed by object api name.
#[async_trait]
pub trait ObjectInfoSource: Send + Sync {
    async fn object_info(&self, api_name: &str) -> Option<ObjectInfo>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticObjectInfoSource {
    infos: BTreeMap<String, ObjectInfo>,
}

impl StaticObjectInfoSource {
    pub fn new(infos: impl IntoIterator<Item = ObjectInfo>) -> Self {
        Self {
            infos: infos
                .into_iter()
                .map(|info| (info.api_name.clone(), info))
                .collect(),
        }
    }

    pub fn insert(&mut self, info: ObjectInfo) {
        self.infos.insert(info.api_name.clone(), info);
    }
}

#[async_trait]
impl ObjectInfoSource for StaticObjectInfoSource {
    async fn object_info(&self, api_name: &str) -> Option<ObjectInfo> {
        self.infos.get(api_name).cloned()
    }
}

/// Object info for `api_name`, or an empty one when the source has none.
pub(crate) async fn object_info_or_empty(
    source: &dyn ObjectInfoSource,
    api_name: &str,
) -> ObjectInfo {
    match source.object_info(api_name).await {
        Some(info) => info,
        None => ObjectInfo::new(api_name, ""),
    }
}
