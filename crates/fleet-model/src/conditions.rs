//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use fleet_common::{ConditionsConfig, Life, MigrationPhase};
use tokio::sync::watch;
use tracing::info;

/// Writable side of the externally supplied model conditions.
///
/// Flag manifolds never read these values directly; they reach them through
/// the [`ApiConnection`] exposed by the api-caller manifold.
#[derive(Debug)]
pub struct Conditions {
    responsible: watch::Sender<bool>,
    life: watch::Sender<Life>,
    credential_valid: watch::Sender<bool>,
    migration_phase: watch::Sender<MigrationPhase>,
}

impl Default for Conditions {
    fn default() -> Self {
        Self::new(&ConditionsConfig::default())
    }
}

impl Conditions {
    pub fn new(config: &ConditionsConfig) -> Self {
        Self {
            responsible: watch::channel(config.responsible).0,
            life: watch::channel(config.life).0,
            credential_valid: watch::channel(config.credential_valid).0,
            migration_phase: watch::channel(config.migration_phase).0,
        }
    }

    pub fn set_responsible(&self, responsible: bool) {
        if self.responsible.send_if_modified(|current| {
            std::mem::replace(current, responsible) != responsible
        }) {
            info!(responsible, "responsibility changed");
        }
    }

    pub fn set_life(&self, life: Life) {
        if self
            .life
            .send_if_modified(|current| std::mem::replace(current, life) != life)
        {
            info!(?life, "model life changed");
        }
    }

    pub fn set_credential_valid(&self, valid: bool) {
        if self
            .credential_valid
            .send_if_modified(|current| std::mem::replace(current, valid) != valid)
        {
            info!(valid, "credential validity changed");
        }
    }

    pub fn set_migration_phase(&self, phase: MigrationPhase) {
        if self
            .migration_phase
            .send_if_modified(|current| std::mem::replace(current, phase) != phase)
        {
            info!(?phase, "migration phase changed");
        }
    }

    pub fn migration_phase(&self) -> MigrationPhase {
        *self.migration_phase.borrow()
    }

    /// Read-only view handed to the api-caller worker.
    pub fn connection(&self) -> ApiConnection {
        ApiConnection {
            responsible: self.responsible.subscribe(),
            life: self.life.subscribe(),
            credential_valid: self.credential_valid.subscribe(),
            migration_phase: self.migration_phase.subscribe(),
        }
    }
}

/// Controller connection exposed by the api-caller manifold.
#[derive(Debug, Clone)]
pub struct ApiConnection {
    responsible: watch::Receiver<bool>,
    life: watch::Receiver<Life>,
    credential_valid: watch::Receiver<bool>,
    migration_phase: watch::Receiver<MigrationPhase>,
}

impl ApiConnection {
    pub fn responsible(&self) -> watch::Receiver<bool> {
        self.responsible.clone()
    }

    pub fn life(&self) -> watch::Receiver<Life> {
        self.life.clone()
    }

    pub fn credential_valid(&self) -> watch::Receiver<bool> {
        self.credential_valid.clone()
    }

    pub fn migration_phase(&self) -> watch::Receiver<MigrationPhase> {
        self.migration_phase.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_observes_updates() {
        let conditions = Conditions::default();
        let connection = conditions.connection();
        let mut life = connection.life();
        assert_eq!(*life.borrow_and_update(), Life::Alive);

        conditions.set_life(Life::Dying);
        assert!(life.has_changed().expect("sender alive"));
        assert_eq!(*life.borrow_and_update(), Life::Dying);

        conditions.set_life(Life::Dying);
        assert!(!life.has_changed().expect("sender alive"));
    }

    #[test]
    fn initial_values_follow_config() {
        let conditions = Conditions::new(&ConditionsConfig {
            responsible: false,
            migration_phase: MigrationPhase::Import,
            ..ConditionsConfig::default()
        });
        let connection = conditions.connection();
        assert!(!*connection.responsible().borrow());
        assert_eq!(*connection.migration_phase().borrow(), MigrationPhase::Import);
        assert_eq!(conditions.migration_phase(), MigrationPhase::Import);
    }
}
