//! Agent registry: long-lived named identities with private workspaces.
//!
//! Two reserved ids exist. `__config__` is the system agent that always
//! follows the current default model; `main` is the primary agent and cannot
//! be deleted. Both are policy guards in the mutation paths, not special
//! structure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CONFIG_AGENT_ID: &str = "__config__";
pub const MAIN_AGENT_ID: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_color: String,
    pub workspace_dir: PathBuf,
    pub session_dir: PathBuf,
    /// Reference into the model registry; empty = default model.
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Reserved/system agents get policy guards in update paths.
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub created_at_ms: i64,
}

pub struct Manager {
    path: PathBuf,
    workspace_root: PathBuf,
    agents: RwLock<HashMap<String, Agent>>,
}

impl Manager {
    /// Load the registry (or seed it with the reserved agents on first run).
    pub fn new(data_dir: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        let workspace_root = workspace_root.into();
        std::fs::create_dir_all(&data_dir)?;
        let path = data_dir.join("agents.json");

        let mut agents: HashMap<String, Agent> = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str::<Vec<Agent>>(&data)?
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut seeded = false;
        for (id, name, system) in [
            (MAIN_AGENT_ID, "Main", false),
            (CONFIG_AGENT_ID, "Config Assistant", true),
        ] {
            if !agents.contains_key(id) {
                agents.insert(id.to_string(), Self::blank_agent(&workspace_root, id, name, system));
                seeded = true;
            }
        }

        let mgr = Self {
            path,
            workspace_root,
            agents: RwLock::new(agents),
        };
        if seeded {
            mgr.save()?;
        }
        Ok(mgr)
    }

    fn blank_agent(workspace_root: &PathBuf, id: &str, name: &str, system: bool) -> Agent {
        let workspace_dir = workspace_root.join(id);
        Agent {
            id: id.to_string(),
            name: name.to_string(),
            avatar_color: String::new(),
            session_dir: workspace_dir.join("sessions"),
            workspace_dir,
            model_id: String::new(),
            env: HashMap::new(),
            system,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().expect("agents lock").get(id).cloned()
    }

    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> =
            self.agents.read().expect("agents lock").values().cloned().collect();
        agents.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        agents
    }

    pub fn create(&self, id: &str, name: &str) -> anyhow::Result<Agent> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            anyhow::bail!("invalid agent id {:?}", id);
        }
        {
            let agents = self.agents.read().expect("agents lock");
            if agents.contains_key(id) {
                anyhow::bail!("agent {:?} already exists", id);
            }
        }
        let agent = Self::blank_agent(&self.workspace_root, id, name, false);
        std::fs::create_dir_all(&agent.workspace_dir)?;
        std::fs::create_dir_all(&agent.session_dir)?;
        self.agents
            .write()
            .expect("agents lock")
            .insert(id.to_string(), agent.clone());
        self.save()?;
        info!(agent = id, "created agent");
        Ok(agent)
    }

    /// Destroy an agent record. Reserved ids are refused.
    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        if id == MAIN_AGENT_ID || id == CONFIG_AGENT_ID {
            anyhow::bail!("agent {:?} is reserved and cannot be deleted", id);
        }
        {
            let mut agents = self.agents.write().expect("agents lock");
            if agents.remove(id).is_none() {
                anyhow::bail!("agent {:?} not found", id);
            }
        }
        self.save()
    }

    pub fn rename(&self, id: &str, name: &str) -> anyhow::Result<()> {
        self.mutate(id, |a| a.name = name.to_string())
    }

    pub fn set_model(&self, id: &str, model_id: &str) -> anyhow::Result<()> {
        if id == CONFIG_AGENT_ID {
            anyhow::bail!("the config agent always follows the default model");
        }
        self.mutate(id, |a| a.model_id = model_id.to_string())
    }

    /// Set (`Some`) or remove (`None`) one env var. This is the callback
    /// behind the self_set_env / self_delete_env tools.
    pub fn set_env_var(&self, id: &str, key: &str, value: Option<&str>) -> anyhow::Result<()> {
        self.mutate(id, |a| match value {
            Some(v) => {
                a.env.insert(key.to_string(), v.to_string());
            }
            None => {
                a.env.remove(key);
            }
        })
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut Agent)) -> anyhow::Result<()> {
        {
            let mut agents = self.agents.write().expect("agents lock");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("agent {:?} not found", id))?;
            f(agent);
        }
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        let agents = self.list();
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&agents)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Manager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Manager::new(dir.path().join("data"), dir.path().join("workspaces")).unwrap();
        (mgr, dir)
    }

    #[test]
    fn seeds_reserved_agents() {
        let (mgr, _dir) = manager();
        assert!(mgr.get(MAIN_AGENT_ID).is_some());
        let config = mgr.get(CONFIG_AGENT_ID).unwrap();
        assert!(config.system);
    }

    #[test]
    fn reserved_agents_cannot_be_deleted() {
        let (mgr, _dir) = manager();
        assert!(mgr.delete(MAIN_AGENT_ID).is_err());
        assert!(mgr.delete(CONFIG_AGENT_ID).is_err());
    }

    #[test]
    fn create_update_delete_cycle() {
        let (mgr, _dir) = manager();
        let agent = mgr.create("researcher", "Researcher").unwrap();
        assert!(agent.workspace_dir.ends_with("researcher"));
        assert!(agent.workspace_dir.exists());

        mgr.rename("researcher", "Deep Researcher").unwrap();
        mgr.set_model("researcher", "m1").unwrap();
        let updated = mgr.get("researcher").unwrap();
        assert_eq!(updated.name, "Deep Researcher");
        assert_eq!(updated.model_id, "m1");

        mgr.delete("researcher").unwrap();
        assert!(mgr.get("researcher").is_none());
    }

    #[test]
    fn duplicate_and_invalid_ids_rejected() {
        let (mgr, _dir) = manager();
        mgr.create("a1", "A").unwrap();
        assert!(mgr.create("a1", "A again").is_err());
        assert!(mgr.create("", "x").is_err());
        assert!(mgr.create("../evil", "x").is_err());
    }

    #[test]
    fn env_vars_set_and_remove() {
        let (mgr, _dir) = manager();
        mgr.set_env_var(MAIN_AGENT_ID, "TOKEN", Some("t1")).unwrap();
        assert_eq!(
            mgr.get(MAIN_AGENT_ID).unwrap().env.get("TOKEN"),
            Some(&"t1".to_string())
        );
        mgr.set_env_var(MAIN_AGENT_ID, "TOKEN", None).unwrap();
        assert!(mgr.get(MAIN_AGENT_ID).unwrap().env.get("TOKEN").is_none());
    }

    #[test]
    fn config_agent_model_is_pinned_to_default() {
        let (mgr, _dir) = manager();
        assert!(mgr.set_model(CONFIG_AGENT_ID, "m1").is_err());
    }

    #[test]
    fn registry_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let ws = dir.path().join("workspaces");
        {
            let mgr = Manager::new(&data, &ws).unwrap();
            mgr.create("persistent", "P").unwrap();
            mgr.set_env_var("persistent", "K", Some("V")).unwrap();
        }
        let mgr = Manager::new(&data, &ws).unwrap();
        let agent = mgr.get("persistent").unwrap();
        assert_eq!(agent.env.get("K"), Some(&"V".to_string()));
    }
}
