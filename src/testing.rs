//! Test doubles for the external collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::EscrowConfig;
use crate::error::{AppError, AppResult};
use crate::escrow::gateway::{GatewayResult, GatewayStatus, MovementRequest, PaymentGateway};
use crate::escrow::Movement;
use crate::ledger::models::{
    EscrowDirection, EscrowStatus, EscrowTransaction, Investment, InvestmentStatus,
};
use crate::settlement::auth::{AuthorizationCheck, AuthorizationRequest, AuthorizationVerdict};
use crate::settlement::notifier::{NotificationDispatcher, NotificationPayload};

pub fn fast_escrow_config() -> EscrowConfig {
    EscrowConfig {
        max_attempts: 3,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        max_rounds: 5,
    }
}

/// A freshly created investment with no escrow activity
pub fn sample_investment() -> Investment {
    let now = chrono::Utc::now();
    Investment {
        id: Uuid::new_v4(),
        pitch_id: Uuid::new_v4(),
        business_id: Uuid::new_v4(),
        business_name: "Kampala Coffee Roasters".into(),
        investor_id: Uuid::new_v4(),
        amount: dec!(100000),
        currency: "UGX".into(),
        share_price: dec!(1000),
        shares: dec!(100),
        outstanding_shares: None,
        threshold_percent: dec!(60),
        investor_payment_ref: "investor-wallet".into(),
        business_payment_ref: "business-wallet".into(),
        status: InvestmentStatus::Created,
        requires_reconciliation: false,
        failure_reason: None,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

/// First round of a movement, opened just now by some other caller
pub fn pending_round(movement: &Movement) -> EscrowTransaction {
    let now = chrono::Utc::now();
    EscrowTransaction {
        id: Uuid::new_v4(),
        reference_id: movement.reference_id,
        subject: movement.subject,
        direction: movement.direction,
        idempotency_key: movement.key(),
        round: 1,
        status: EscrowStatus::Pending,
        amount: movement.amount,
        currency: movement.currency.clone(),
        party_ref: movement.party_ref.clone(),
        attempt_count: 0,
        last_error: None,
        provider_ref: None,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

/// Gateway whose per-call outcomes are scripted per direction
///
/// Behaves like a real provider: a key that already succeeded returns the
/// cached result without moving funds again.
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<EscrowDirection, VecDeque<GatewayStatus>>>,
    always_fail: Mutex<HashSet<EscrowDirection>>,
    settled: Mutex<HashMap<String, GatewayResult>>,
    calls: Mutex<Vec<(EscrowDirection, String)>>,
    movements: Mutex<Vec<(EscrowDirection, String, Decimal)>>,
    delay: Mutex<Duration>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            settled: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            movements: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Every provider call takes this long before answering
    pub fn slow(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Queue outcomes for the next calls; succeeds once the queue is empty
    pub fn push(&self, direction: EscrowDirection, outcomes: &[GatewayStatus]) {
        self.scripts
            .lock()
            .entry(direction)
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn fail_always(&self, direction: EscrowDirection) {
        self.always_fail.lock().insert(direction);
    }

    pub fn recover(&self, direction: EscrowDirection) {
        self.always_fail.lock().remove(&direction);
        self.scripts.lock().remove(&direction);
    }

    pub fn calls(&self, direction: EscrowDirection) -> usize {
        self.calls.lock().iter().filter(|(d, _)| *d == direction).count()
    }

    /// Amounts actually moved at the provider
    pub fn movements(&self, direction: EscrowDirection) -> Vec<Decimal> {
        self.movements
            .lock()
            .iter()
            .filter(|(d, _, _)| *d == direction)
            .map(|(_, _, amount)| *amount)
            .collect()
    }

    async fn respond(&self, direction: EscrowDirection, request: &MovementRequest) -> GatewayResult {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.handle(direction, request)
    }

    fn handle(&self, direction: EscrowDirection, request: &MovementRequest) -> GatewayResult {
        self.calls
            .lock()
            .push((direction, request.idempotency_key.clone()));

        if let Some(done) = self.settled.lock().get(&request.idempotency_key) {
            return done.clone();
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&direction)
            .and_then(|queue| queue.pop_front());
        let status = match scripted {
            Some(status) => status,
            None if self.always_fail.lock().contains(&direction) => GatewayStatus::Failed,
            None => GatewayStatus::Succeeded,
        };

        match status {
            GatewayStatus::Succeeded => {
                let result = GatewayResult::succeeded(format!("prov-{}", Uuid::new_v4()));
                self.settled
                    .lock()
                    .insert(request.idempotency_key.clone(), result.clone());
                self.movements.lock().push((
                    direction,
                    request.idempotency_key.clone(),
                    request.amount,
                ));
                result
            }
            GatewayStatus::Pending => GatewayResult::pending(),
            GatewayStatus::Failed => GatewayResult::failed("insufficient float"),
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn collect(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        Ok(self.respond(EscrowDirection::Collect, request).await)
    }

    async fn disburse(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        Ok(self.respond(EscrowDirection::Disburse, request).await)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Returns the same verdict for every caller
pub struct StaticAuthorization {
    pub verdict: AuthorizationVerdict,
}

impl StaticAuthorization {
    pub fn allow() -> Self {
        Self {
            verdict: AuthorizationVerdict {
                identity_confirmed: true,
                pin_verified: true,
            },
        }
    }

    pub fn pin_rejected() -> Self {
        Self {
            verdict: AuthorizationVerdict {
                identity_confirmed: true,
                pin_verified: false,
            },
        }
    }
}

#[async_trait]
impl AuthorizationCheck for StaticAuthorization {
    async fn verify(&self, _request: &AuthorizationRequest) -> AuthorizationVerdict {
        self.verdict
    }
}

/// Records every notification; optionally fails each delivery
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Uuid, Uuid, NotificationPayload)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let notifier = Self::new();
        notifier.failing.store(true, Ordering::SeqCst);
        notifier
    }

    pub fn count_where(&self, predicate: impl Fn(&NotificationPayload) -> bool) -> usize {
        self.sent.lock().iter().filter(|(_, _, p)| predicate(p)).count()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(
        &self,
        recipient_id: Uuid,
        investment_id: Uuid,
        payload: &NotificationPayload,
    ) -> AppResult<()> {
        self.sent
            .lock()
            .push((recipient_id, investment_id, payload.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ExternalError("notification channel down".into()));
        }
        Ok(())
    }
}
