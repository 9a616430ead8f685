// Investment settlement: lifecycle coordination, identity checks, notices
pub mod auth;
pub mod coordinator;
pub mod notifier;
pub mod scheduler;

pub use auth::{AuthorizationCheck, DenyAll, HttpAuthorizationCheck};
pub use coordinator::{
    ApprovalResult, InvestmentView, NewInvestment, NewShareholder, SettlementCoordinator,
    SweepReport,
};
pub use notifier::{ChannelNotifier, FanoutNotifier, NotificationDispatcher, WebhookNotifier};
pub use scheduler::SweepScheduler;
