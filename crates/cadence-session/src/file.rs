use crate::session::Session;
use crate::store::{
    mirror_event, new_session_id, not_found, record_event, GetSessionConfig, SessionStore,
};
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Event, StateMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Durable session store: one JSON document per session at
/// `<dir>/<app_name>/<user_id>/<session_id>.json`.
///
/// All writes go through a single lock so appends to one session are
/// serialized within the process.
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub async fn new(dir: PathBuf) -> CadenceResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn user_dir(&self, app_name: &str, user_id: &str) -> CadenceResult<PathBuf> {
        validate_component(app_name)?;
        validate_component(user_id)?;
        Ok(self.dir.join(app_name).join(user_id))
    }

    fn session_path(&self, app_name: &str, user_id: &str, id: &str) -> CadenceResult<PathBuf> {
        validate_component(id)?;
        Ok(self.user_dir(app_name, user_id)?.join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> CadenceResult<Option<Session>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let session: Session = serde_json::from_str(&data)
            .map_err(|e| CadenceError::Session(format!("Failed to parse session: {e}")))?;
        Ok(Some(session))
    }

    async fn write(&self, path: &Path, session: &Session) -> CadenceResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(session)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn validate_component(value: &str) -> CadenceResult<()> {
    let invalid = value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
        || value.contains("..");
    if invalid {
        return Err(CadenceError::Session(format!(
            "Invalid session path component: {value:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> CadenceResult<Session> {
        let id = new_session_id(session_id);
        let path = self.session_path(app_name, user_id, &id)?;
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(CadenceError::Session(format!(
                "Session with id {id} already exists"
            )));
        }
        let session = Session::new(app_name, user_id, &id, state.unwrap_or_default());
        self.write(&path, &session).await?;
        debug!(app = %app_name, user = %user_id, session_id = %id, "Session created on disk");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> CadenceResult<Option<Session>> {
        let path = self.session_path(app_name, user_id, session_id)?;
        let Some(mut session) = self.read(&path).await? else {
            return Ok(None);
        };
        if let Some(config) = config {
            config.apply(&mut session);
        }
        Ok(Some(session))
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> CadenceResult<Event> {
        if event.partial {
            return Ok(event);
        }
        let path = self.session_path(&session.app_name, &session.user_id, &session.id)?;
        let _guard = self.write_lock.lock().await;
        let mut stored = self
            .read(&path)
            .await?
            .ok_or_else(|| not_found(&session.app_name, &session.user_id, &session.id))?;
        let recorded = record_event(&mut stored, session, &event)?;
        // The caller's copy only changes once the event is durable.
        self.write(&path, &stored).await?;
        mirror_event(session, &stored, event);
        Ok(recorded)
    }

    async fn list_events(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<Vec<Event>> {
        let path = self.session_path(app_name, user_id, session_id)?;
        self.read(&path)
            .await?
            .map(|s| s.events)
            .ok_or_else(|| not_found(app_name, user_id, session_id))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> CadenceResult<Vec<Session>> {
        let dir = self.user_dir(app_name, user_id)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(session)) => sessions.push(session.without_events()),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<()> {
        let path = self.session_path(app_name, user_id, session_id)?;
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}
