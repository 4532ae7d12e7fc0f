//! Two peers edit the same paragraph while one of them is offline, then
//! reconnect. Run with `RUST_LOG=debug` to follow every sync pass.

use log::info;
use uuid::Uuid;
use weft_collab::{ClientConfig, ClientError, LocalHub};
use weft_core::{CoreError, EditorUpdate, NodeKey};

fn append_to_first_paragraph(u: &mut EditorUpdate<'_>, text: &str) -> Result<(), CoreError> {
    let paragraph = u.state().root().first_child().ok_or(CoreError::NodeNotFound(NodeKey::ROOT))?;
    let node = u.create_text(text)?;
    u.append(paragraph, node)
}

fn main() -> Result<(), ClientError> {
    env_logger::init();

    info!("Starting weft simulation...");

    let mut hub = LocalHub::new(Uuid::new_v4());
    let alice = hub.add_client("alice", ClientConfig { bootstrap: true, ..ClientConfig::default() })?;
    let bob = hub.add_client("bob", ClientConfig::default())?;

    hub.connect(alice)?;
    hub.connect(bob)?;
    info!("both peers share {}", hub.clients()[bob].content_json());

    hub.disconnect(bob)?;
    hub.update(alice, |u| append_to_first_paragraph(u, "Hello world"))?;
    hub.update(bob, |u| append_to_first_paragraph(u, "Hello world"))?;
    hub.pump()?;

    hub.connect(bob)?;

    for client in hub.clients() {
        println!("{:>6}: {:?}", client.info().name, client.text_content());
        client.verify()?;
    }
    println!("{}", hub.clients()[alice].content_json());
    info!("{} messages delivered", hub.delivered());
    Ok(())
}
