use super::Reply;
use crate::engine::EngineHandle;
use crate::error::CallError;
use crate::view::CallView;

pub const HELP: &str =
    "commands: start | call <user> | hangup | name <new name> | users | status | quit";

/// Renames locally; the server may still force another name.
pub fn rename(engine: &EngineHandle, name: &str) -> Result<Reply, CallError> {
    engine.rename(name.trim())?;
    Ok(Reply::Silent)
}

pub fn users(view: &CallView) -> Reply {
    let others: Vec<&str> = view.callable_users().collect();
    if others.is_empty() {
        Reply::Text("nobody else is online".into())
    } else {
        Reply::Text(format!("online: {}", others.join(", ")))
    }
}

pub async fn status(engine: &EngineHandle) -> Result<Reply, CallError> {
    let snap = engine.snapshot().await?;
    let peer = match &snap.remote {
        Some(remote) => format!(" with {remote}"),
        None => String::new(),
    };
    Ok(Reply::Text(format!(
        "{} (id {}): {}{}, capture {}",
        snap.identity.name,
        snap.identity.id,
        snap.state,
        peer,
        if snap.capture_ready { "on" } else { "off" },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Command, EngineEvent};

    #[test]
    fn lists_other_users() {
        let mut view = CallView::new("alice");
        assert_eq!(users(&view), Reply::Text("nobody else is online".into()));
        view.users = vec!["alice".into(), "bob".into(), "carol".into()];
        assert_eq!(users(&view), Reply::Text("online: bob, carol".into()));
    }

    #[test]
    fn rename_trims_before_posting() {
        let (engine, mut rx) = EngineHandle::detached();
        rename(&engine, "  robert ").unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::Command(Command::Rename(name))) if name == "robert"
        ));
    }
}
