//! # rcsw

mod cli;
mod cluster;
mod error;
mod events;
mod labels;
mod link;
mod metrics;
mod mutators;
mod naming;
mod queue;
mod reconciler;
mod recorder;
mod resolver;
mod selector;
mod translator;
mod watcher;

use cata::execute;
use clap::Parser;
use eyre::Result;

use crate::cli::Root;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .display_location_section(false)
        .install()?;

    let root = Root::parse();
    execute(&root).await
}
