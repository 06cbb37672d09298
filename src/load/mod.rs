mod config;
mod report;
mod runner;
pub mod scenario;
pub mod template;

pub use config::{ScenarioConfig, ScenarioKind};
pub use report::{ScenarioRunResult, TallyRow};
pub use runner::{ScenarioPhase, ScenarioRunner};
pub use scenario::{CommandScenario, MessageScenario, NotificationScenario, Scenario};
