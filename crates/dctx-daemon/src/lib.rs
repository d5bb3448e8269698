//! Process bootstrap for the broker daemon: loads config, opens the
//! Session & Context Store, wires the Meta-Broker and command surface
//! from `dctx-harness`/`dctx-bridge`/`dctx-agents`, and serves the
//! tool-invocation HTTP route (§6.1) until shutdown.

pub mod daemon;
