//! # libsirius_ioc
//!
//! libsirius_ioc is the soft-IOC runtime of the Sirius control system, written in Rust.
//! It publishes a typed, access-controlled channel database over a TCP bus, follows
//! external channels served by other IOCs, serializes device side effects through a
//! work queue, and persists selected channels across restarts.
//!
//! Two applications are built on top of the runtime:
//!
//! - `sirius_epu_ioc`: the EPU50 insertion-device controller (gap and phase drive pairs)
//! - `sirius_sofb_ioc`: the slow orbit feedback of the storage ring or the booster
//!
//! ## Building & Install
//!
//! To build and install the IOCs use `cargo install --path ./sirius_epu_ioc` and
//! `cargo install --path ./sirius_sofb_ioc` from the top level repository.
//!
//! ## Configuration
//!
//! Every IOC reads a YAML file with an `ioc` section, shared by all IOCs, and an
//! application section (`epu` or `sofb`). A template is written by the `new` subcommand of
//! either binary. The `ioc` section looks like
//!
//! ```yml
//! ioc:
//!   root_prefix: ''
//!   prefix: 'SI-Glob:AP-SOFB:'
//!   bind_address: 0.0.0.0:0
//!   addr_list: ['10.0.38.10:5064']
//!   scan_interval: 0.1
//!   connection_timeout: 0.5
//!   probe_timeout: 0.5
//!   queue_capacity: 1000
//!   access_rules: null
//!   log_dir: log
//!   lock_dir: /tmp/sirius_ioc
//!   autosave:
//!     enabled: true
//!     dir: autosave
//!     request_file: sofb.req
//!     basename: sofb
//!     period: 30.0
//!     max_files: 10
//!     restore_delay: 5.0
//!     timeout: 1.0
//! ```
//!
//! The `VACA_PREFIX` environment variable, when set, replaces `root_prefix`. Every
//! served channel is named `<root_prefix><prefix><channel>`. Only one process per host may
//! serve a prefix: each IOC holds a lock file named after its prefix in `lock_dir`, and also
//! probes the servers of `addr_list` for an instance running elsewhere.
//!
//! ## Channels
//!
//! Channel suffixes state intent: `-SP` setpoints and `-Sel` selectors are written by
//! clients and mirrored on their `-RB`/`-Sts` readbacks; `-Cmd` channels count accepted
//! writes; `-Mon` monitors and `-Cte` constants are read-only. Every IOC serves
//! `Version-Cte`, `Properties-Cte` and `Log-Mon`, the last message shown to operators.
//!
//! ## Output
//!
//! Each IOC writes a rotating log file named after it into `log_dir`. Save files are
//! named `<basename>__<YYYY-MM-DD_HH-MM-SS>__.sav` and hold one `name value` pair per line.
pub mod access;
pub mod autosave;
pub mod bus;
pub mod channel;
pub mod config;
pub mod database;
pub mod devices;
pub mod driver;
pub mod epu;
pub mod error;
pub mod ioc;
pub mod lock;
pub mod logging;
pub mod queue;
pub mod sofb;
pub mod status;
