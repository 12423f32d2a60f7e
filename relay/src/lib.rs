//! Umbrella crate tying the proxy's library (`relay-core`), its config
//! loader (`relay-config`), and its binary entry point (`relay-bin`)
//! together under a single workspace version.

pub use relay_bin::run;
pub use relay_config::Config;
pub use relay_core::{run_proxy, Registry};
