pub mod cmd;
pub mod loopdev;
pub mod luks2;
pub mod mkfs;
pub mod mount;
pub mod rsync;

use lazy_static::lazy_static;
use tokio::sync::RwLock;

lazy_static! {
    static ref VERBOSE: RwLock<bool> = RwLock::new(false);
}

/// Make external tools (cryptsetup, rsync, ...) chatty when debug logging is on.
pub async fn set_verbose(verbose: bool) {
    *VERBOSE.write().await = verbose;
}

pub(crate) async fn get_verbose() -> bool {
    *VERBOSE.read().await
}
