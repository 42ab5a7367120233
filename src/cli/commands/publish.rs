//! Publish and unpublish commands - volume records

use super::Node;
use crate::cli::args::{PublishArgs, UnpublishArgs};
use crate::config::Config;
use crate::error::AgentCacheResult;
use crate::publisher::VolumePublisher;
use crate::ui::{Report, Tone, UiContext};

/// Execute the publish command, printing the directory to mount
pub async fn publish(args: PublishArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;
    let publisher = VolumePublisher::new(node.store, node.paths);

    let path = publisher
        .publish(&args.volume_id, &args.pod, &args.tenant)
        .await?;
    println!("{}", path.display());
    Ok(())
}

/// Execute the unpublish command
pub async fn unpublish(args: UnpublishArgs, config: &Config) -> AgentCacheResult<()> {
    let node = Node::open(config).await?;
    let publisher = VolumePublisher::new(node.store, node.paths);

    let mut out = Report::bare();
    match publisher.unpublish(&args.volume_id).await? {
        Some(volume) => out.step_with(Tone::Ok, "Removed volume", volume.volume_id),
        None => out.step(
            Tone::Info,
            format!("Volume {} was not recorded", args.volume_id),
        ),
    };
    out.print(&UiContext::detect());
    Ok(())
}
