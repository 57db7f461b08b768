use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use trellis_core::{logging, Config, Store};
use trellis_cross_sign::{CrossSigner, MemoryClaimStream};
use trellis_crypto::{KeyManager, KeyPair};
use trellis_gestalt::{GestaltAction, GestaltGraph, GestaltLinkNode, NodeInfo};
use trellis_sigchain::Sigchain;

const NODE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default_config(),
    };
    logging::try_init_with(&config.logging);

    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating {}", config.node.data_dir.display()))?;
    let store = Arc::new(Store::open(config.db_path())?);

    let local_keys = Arc::new(KeyPair::load_or_generate(config.key_path())?);
    let peer_keys = Arc::new(KeyPair::load_or_generate(
        config.node.data_dir.join("peer.key"),
    )?);
    info!(
        local = %local_keys.node_id(),
        peer = %peer_keys.node_id(),
        db = %config.db_path().display(),
        "Trellis node starting"
    );

    let local_chain = Arc::new(Sigchain::open(Arc::clone(&store), local_keys, &config.sigchain)?);
    let peer_chain = Arc::new(Sigchain::open(Arc::clone(&store), peer_keys, &config.sigchain)?);
    let local = CrossSigner::new(Arc::clone(&local_chain), &config.handshake);
    let peer = CrossSigner::new(Arc::clone(&peer_chain), &config.handshake);

    let (mut local_stream, mut peer_stream) = MemoryClaimStream::pair();
    let (initiated, answered) = tokio::join!(
        local.claim_node(&mut local_stream, peer.node_id()),
        peer.handle_claim_node(&mut peer_stream, local.node_id()),
    );
    let (claim_id, claim) = initiated?;
    let (peer_claim_id, peer_claim) = answered?;
    info!(
        claim_id = %claim_id,
        peer_claim_id = %peer_claim_id,
        seq = claim.payload().seq,
        "Cross-signed link committed"
    );

    let graph = GestaltGraph::new(Arc::clone(&store));
    let local_info = NodeInfo::new(local.node_id());
    let peer_info = NodeInfo::new(peer.node_id());
    graph.link_node_and_node(&local_info, &peer_info, &GestaltLinkNode { claim })?;
    graph.link_node_and_node(&peer_info, &local_info, &GestaltLinkNode { claim: peer_claim })?;
    graph.set_gestalt_action_by_node(&local_info.node_id, GestaltAction::Notify)?;

    let gestalt = graph
        .get_gestalt_by_node(&local_info.node_id)?
        .ok_or_else(|| anyhow!("gestalt for {} vanished", local_info.node_id))?;
    let actions = graph.get_gestalt_actions_by_node(&local_info.node_id)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "gestalt": gestalt,
            "actions": actions,
            "chains": {
                "local": local_chain.len()?,
                "peer": peer_chain.len()?,
            },
        }))?
    );
    Ok(())
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(anyhow!("--config was provided without a path")),
            };
        }
    }
    Ok(None)
}
