use super::Uid;
use super::wire::Event;

/// The application's session registry, called by the cluster core.
pub trait SessionRegistry: Send + Sync + 'static {
    /// Host key this node is reachable under when it is not a configured
    /// cluster server (for example a gateway).
    fn node_id(&self) -> String;

    fn online_user_ids(&self) -> Vec<Uid>;

    /// Hand an event to a local session. Returns whether it was accepted.
    fn deliver(&self, event: &Event) -> bool;

    /// The user logged in on `domain:port`; the local session should be told and closed.
    fn on_duplicate_login(&self, uid: Uid, time: u64, domain: &str, port: u16) -> bool;
}
