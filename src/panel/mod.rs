/// Panel HTTP client and wire types
pub mod api;
pub mod directory;
pub mod traffic;

pub use api::{
    DirectorySource, NodeInfo, PanelClient, PanelUser, RESERVED_USER_ID, ReportingSink,
    TrafficRecord, UserId,
};
pub use directory::{CredentialDirectory, DirectorySnapshot, UserRecord};
pub use traffic::TrafficAccountant;
