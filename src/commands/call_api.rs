use super::Reply;
use crate::engine::EngineHandle;
use crate::error::CallError;
use crate::view::CallView;

/// Starts local capture; readiness arrives as a notification.
pub fn start(engine: &EngineHandle) -> Result<Reply, CallError> {
    engine.start_media_capture()?;
    Ok(Reply::Text("starting camera and microphone...".into()))
}

pub async fn call(engine: &EngineHandle, view: &CallView, target: &str) -> Result<Reply, CallError> {
    engine.place_call(target).await?;
    if !view.users.is_empty() && !view.users.iter().any(|u| u == target) {
        tracing::warn!(%target, "calling a user that is not on the roster");
        return Ok(Reply::Text(format!("{target} is not on the user list, calling anyway")));
    }
    Ok(Reply::Silent)
}

pub fn hang_up(engine: &EngineHandle) -> Result<Reply, CallError> {
    engine.hang_up()?;
    Ok(Reply::Silent)
}
