pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    ChunkingSettings, ProviderSettings, RerankSettings, RetrievalSettings, ServerSettings,
    Settings, TimeoutSettings,
};
