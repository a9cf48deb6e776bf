/// Upstream node integration: the RPC client, the template-backed
/// `WorkSource` implementation, and the poll loop that feeds the server.
pub mod node;
pub mod work;

pub use node::NodeClient;
pub use work::{ChainWork, WorkManager};
