pub struct Icons;

impl Icons {
    pub const DATABASE: &str = "🗄️";
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const STATS: &str = "📊";
    pub const BLOB: &str = "📦";
    pub const JOURNAL: &str = "📝";
    pub const ERASE: &str = "🗑️";
    pub const CLOCK: &str = "⏱️";
    pub const SHRINK: &str = "🗜️";
}
