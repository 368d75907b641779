//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                         |
//! |----------|------------------------------------------|
//! | `serve`  | `Serve`                                  |
//! | `apps`   | `Init`, `Apps`                           |
//! | `backup` | `Export`, `Import`, `Validate`           |
//! | `config` | `Config`                                 |

pub mod apps;
pub mod backup;
pub mod config;
pub mod serve;

pub use apps::{cmd_apps, cmd_init};
pub use backup::{cmd_export, cmd_import, cmd_validate};
pub use config::cmd_config;
pub use serve::cmd_serve;
