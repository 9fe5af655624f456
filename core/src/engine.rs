//! The wager engine: every operation that mutates money or vouchers.
//!
//! BET/SETTLE ORDER (fixed, never reordered):
//!   0. Action-id replay       (a settled round is answered from its SPIN)
//!   1. Loss-limit gate        (inside the transaction, before any write)
//!   2. Wallet read            (IMMEDIATE transaction holds the write lock)
//!   3. Payout decision        (voucher cap/decay, or pure RNG)
//!   4. Wallet debit + credit
//!   5. Ledger BET / WIN / SPIN (a failed insert fails the round)
//!   6. Voucher policy state   (last write before commit)
//!   7. Risk scoring + action  (after commit, never blocks the bet)
//!
//! RULES:
//!   - All randomness flows through the engine's per-slot streams.
//!   - All time flows through the injected clock.
//!   - A failed bet leaves no trace except the STOP audit row of a
//!     tripped loss limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    clock::Clock,
    config::{effective_config, set_tenant_config, EffectiveConfig, SystemConfig},
    context::TenantContext,
    error::{CoreError, CoreResult, LossLimitBreach},
    event::{LedgerEvent, LedgerEventType, NewLedgerEvent},
    outcome_mode::OutcomeMode,
    payout::{compute_payout, compute_pure_rng_payout, PayoutOutcome, PayoutRequest, RoundMode},
    rng::{RngBank, RngSlot, UnitRng},
    safety::{
        compute_risk, enforce_loss_limit, maybe_issue_action, record_loss_limit_stop,
        set_loss_limit, IssuedAction, RiskAssessment, SafetyAction, SafetyLimit, SafetySubject,
        STOP_MESSAGE,
    },
    store::CoreStore,
    types::{round_money, to_cents, to_millis, Cents, Money, UserId},
    voucher::{
        generate_digits, hash_pin, verify_pin, CapRequest, Voucher, VoucherStatus, CODE_DIGITS,
        PIN_DIGITS,
    },
    voucher_policy::{
        build_policy_view, resolve_active_voucher_for_wallet, resolve_wallet_voucher_policy_state,
        RoundUpdate, VoucherPolicyState, VoucherPolicyView,
    },
    win_cap::WinCapSelection,
};

pub const DEFAULT_CURRENCY: &str = "FUN";
const LEDGER_SOURCE: &str = "wager-core";
const CODE_ATTEMPTS: usize = 8;

// ── Requests and receipts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueVoucher {
    pub amount: Money,
    #[serde(default)]
    pub bonus_amount: Money,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cap: CapRequest,
}

/// A freshly issued voucher. The clear-text PIN exists only here.
#[derive(Debug, Clone)]
pub struct IssuedVoucher {
    pub voucher: Voucher,
    pub pin: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub voucher_id: String,
    pub wallet_id: String,
    pub wallet_balance: Money,
    pub bonus_pending: Money,
    pub selection: Option<WinCapSelection>,
    pub policy: VoucherPolicyView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBet {
    pub user_id: UserId,
    pub session_id: String,
    pub game_key: String,
    pub stake: Money,
    #[serde(default)]
    pub action_id: Option<String>,
}

/// What one settled round did. Stored on the SPIN event so a retried
/// action id can be answered without replaying the round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundSettlement {
    pub action_id: String,
    pub game_key: String,
    pub stake: Money,
    pub payout: Money,
    pub balance_before: Money,
    pub balance_after_bet: Money,
    pub balance_after: Money,
    pub outcome_mode: OutcomeMode,
    pub round_mode: RoundMode,
    pub reached_or_exceeded_cap: bool,
    pub decay_step: Money,
    pub voucher_id: Option<String>,
    pub max_cashout: Option<Money>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetReceipt {
    pub settlement: RoundSettlement,
    pub voucher: Option<VoucherPolicyView>,
    pub risk: Option<RiskAssessment>,
    pub safety_action: Option<IssuedAction>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub game_key: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub bet_cents: Option<Cents>,
    #[serde(default)]
    pub win_cents: Option<Cents>,
    #[serde(default)]
    pub balance_cents: Option<Cents>,
    #[serde(default)]
    pub client_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryOutcome {
    pub event: LedgerEvent,
    pub risk: RiskAssessment,
    pub action: Option<IssuedAction>,
}

/// A tripped gate: the STOP that was recorded for it, if the audit
/// insert succeeded. Carried back to the caller alongside the error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopNotice {
    pub message: &'static str,
    pub record: Option<SafetyAction>,
}

/// What the bet transaction produced.
enum RoundResult {
    /// The action id already settled; nothing was written.
    Replayed(RoundSettlement),
    Settled(RoundSettlement, Option<VoucherPolicyView>),
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct WagerEngine {
    store: CoreStore,
    system: SystemConfig,
    clock: Arc<dyn Clock>,
    win_cap_rng: Box<dyn UnitRng + Send>,
    payout_rng: Box<dyn UnitRng + Send>,
    pure_rng: Box<dyn UnitRng + Send>,
    issuance_rng: Box<dyn UnitRng + Send>,
    last_stop: Option<StopNotice>,
}

impl WagerEngine {
    pub fn new(store: CoreStore, system: SystemConfig, rng_bank: RngBank, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            system,
            clock,
            win_cap_rng: Box::new(rng_bank.for_slot(RngSlot::WinCap)),
            payout_rng: Box::new(rng_bank.for_slot(RngSlot::Payout)),
            pure_rng: Box::new(rng_bank.for_slot(RngSlot::PureRng)),
            issuance_rng: Box::new(rng_bank.for_slot(RngSlot::Issuance)),
            last_stop: None,
        }
    }

    /// In-memory, migrated engine with test defaults and a seeded bank.
    pub fn build_test(seed: u64, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let store = CoreStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, SystemConfig::default_test(), RngBank::seeded(seed), clock))
    }

    /// Replace one stream, e.g. with a `SequenceRng` in tests.
    pub fn set_rng(&mut self, slot: RngSlot, rng: Box<dyn UnitRng + Send>) {
        match slot {
            RngSlot::WinCap => self.win_cap_rng = rng,
            RngSlot::Payout => self.payout_rng = rng,
            RngSlot::PureRng => self.pure_rng = rng,
            RngSlot::Issuance => self.issuance_rng = rng,
        }
    }

    pub fn store(&self) -> &CoreStore {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The STOP recorded by the most recent tripped loss limit.
    pub fn take_last_stop(&mut self) -> Option<StopNotice> {
        self.last_stop.take()
    }

    // ── Tenants ──────────────────────────────────────────────────────────────

    pub fn create_tenant(&self, tenant_id: &str, name: &str) -> CoreResult<()> {
        if tenant_id.trim().is_empty() {
            return Err(CoreError::validation("tenant_id", "is required"));
        }
        self.store.insert_tenant(tenant_id, name, to_millis(self.now()))
    }

    pub fn configure_tenant(&self, ctx: &TenantContext, overrides: &Value) -> CoreResult<()> {
        require_staff(ctx, "configure tenant")?;
        self.require_tenant(ctx)?;
        set_tenant_config(&self.store, &ctx.tenant_id, overrides, to_millis(self.now()))
    }

    pub fn effective_config(&self, ctx: &TenantContext) -> CoreResult<EffectiveConfig> {
        effective_config(&self.store, &self.system, &ctx.tenant_id)
    }

    fn require_tenant(&self, ctx: &TenantContext) -> CoreResult<()> {
        if self.store.tenant_exists(&ctx.tenant_id)? {
            Ok(())
        } else {
            Err(CoreError::TenantNotFound {
                tenant_id: ctx.tenant_id.clone(),
            })
        }
    }

    // ── Vouchers ─────────────────────────────────────────────────────────────

    pub fn issue_voucher(&mut self, ctx: &TenantContext, req: IssueVoucher) -> CoreResult<IssuedVoucher> {
        require_staff(ctx, "issue vouchers")?;
        if !req.amount.is_finite() || req.amount <= 0.0 {
            return Err(CoreError::validation("amount", "must be greater than zero"));
        }
        if !req.bonus_amount.is_finite() || req.bonus_amount < 0.0 {
            return Err(CoreError::validation("bonus_amount", "must not be negative"));
        }
        self.require_tenant(ctx)?;
        let now = self.now();

        let mut code = generate_digits(self.issuance_rng.as_mut(), CODE_DIGITS);
        let mut attempts = 1;
        while self.store.code_in_use(&ctx.tenant_id, &code)? {
            if attempts >= CODE_ATTEMPTS {
                return Err(CoreError::validation("code", "could not allocate a unique code"));
            }
            code = generate_digits(self.issuance_rng.as_mut(), CODE_DIGITS);
            attempts += 1;
        }
        let pin = generate_digits(self.issuance_rng.as_mut(), PIN_DIGITS);
        let voucher_id = uuid::Uuid::new_v4().to_string();

        let voucher = Voucher {
            pin_hash: hash_pin(&voucher_id, &pin),
            voucher_id,
            tenant_id: ctx.tenant_id.clone(),
            code,
            amount: round_money(req.amount),
            bonus_amount: round_money(req.bonus_amount),
            currency: req
                .currency
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            status: VoucherStatus::New,
            cap_request: req.cap,
            redeemed_by_user_id: None,
            redeemed_at: None,
            expires_at: req.expires_at,
            policy_state: VoucherPolicyState::default(),
            created_by: ctx.actor_id.clone(),
            created_at: now,
        };

        self.store.in_transaction(|store| {
            store.insert_voucher(&voucher)?;
            store.record_event_best_effort(
                &ctx.tenant_id,
                &NewLedgerEvent::new(LedgerEventType::VoucherIssued, now)
                    .action(voucher.voucher_id.clone())
                    .amount(to_cents(voucher.amount + voucher.bonus_amount))
                    .source(LEDGER_SOURCE)
                    .meta(json!({
                        "voucherId": voucher.voucher_id,
                        "amount": voucher.amount,
                        "bonusAmount": voucher.bonus_amount,
                        "capRequest": voucher.cap_request,
                        "issuedBy": ctx.actor_id,
                    })),
            );
            Ok::<_, CoreError>(())
        })?;
        log::info!(
            "tenant {} issued voucher {} for {}",
            ctx.tenant_id,
            voucher.voucher_id,
            voucher.amount
        );
        Ok(IssuedVoucher { voucher, pin })
    }

    /// Redeem by code and PIN into the user's wallet, freezing the cap.
    pub fn redeem_voucher(
        &mut self,
        ctx: &TenantContext,
        user_id: &str,
        session_id: Option<&str>,
        code: &str,
        pin: &str,
    ) -> CoreResult<Redemption> {
        if user_id.trim().is_empty() {
            return Err(CoreError::validation("user_id", "is required"));
        }
        if code.trim().is_empty() || pin.trim().is_empty() {
            return Err(CoreError::validation("code", "code and pin are required"));
        }
        let now = self.now();
        let tenant_id = ctx.tenant_id.as_str();

        let voucher = match self.store.find_voucher_by_code(tenant_id, code)? {
            Some(v) if verify_pin(&v, pin) => v,
            _ => return Err(CoreError::VoucherNotFound),
        };
        if voucher.status != VoucherStatus::New {
            return Err(CoreError::VoucherNotRedeemable {
                status: voucher.status.to_string(),
            });
        }
        if voucher.is_expired_at(now) {
            self.expire_one(tenant_id, &voucher, now)?;
            return Err(CoreError::VoucherExpired);
        }

        let system = &self.system;
        let rng = self.win_cap_rng.as_mut();
        let redemption = self.store.in_transaction(|store| {
            let config = effective_config(store, system, tenant_id)?;
            let (state, selection) = if config.outcome_mode.is_voucher_controlled() {
                let (cap, selection) = voucher.cap_request.resolve(
                    voucher.amount,
                    voucher.bonus_amount,
                    &config.win_cap_policy,
                    rng,
                );
                (
                    VoucherPolicyState::at_redemption(cap, voucher.amount, &config.win_cap_policy),
                    Some(selection),
                )
            } else {
                (VoucherPolicyState::pure_rng(), None)
            };

            if !store.mark_voucher_redeemed(tenant_id, &voucher.voucher_id, user_id, &state, now)? {
                return Err(CoreError::VoucherNotRedeemable {
                    status: "redeemed".to_string(),
                });
            }

            let wallet = store.find_or_create_wallet(tenant_id, user_id, &voucher.currency, to_millis(now))?;
            let balance = store.credit_debit(
                &wallet.wallet_id,
                voucher.amount,
                "voucher_redeem",
                Some(&voucher.voucher_id),
                Some(&json!({ "code": voucher.code, "maxCashout": state.max_cashout })),
                to_millis(now),
            )?;
            let bonus_pending = if voucher.bonus_amount > 0.0 {
                store.add_bonus_pending(&wallet.wallet_id, voucher.bonus_amount)?
            } else {
                wallet.bonus_pending
            };
            store.set_active_voucher(&wallet.wallet_id, Some(&voucher.voucher_id))?;

            let mut event = NewLedgerEvent::new(LedgerEventType::VoucherRedeemed, now)
                .player(user_id)
                .action(voucher.voucher_id.clone())
                .amount(to_cents(voucher.amount))
                .balance(to_cents(balance))
                .source(LEDGER_SOURCE)
                .meta(json!({
                    "voucherId": voucher.voucher_id,
                    "bonusAmount": voucher.bonus_amount,
                    "maxCashout": state.max_cashout,
                    "selection": selection,
                    "outcomeMode": config.outcome_mode,
                }));
            if let Some(session) = session_id {
                event = event.session(session);
            }
            store.record_event_best_effort(tenant_id, &event);

            let redeemed = store
                .get_voucher(tenant_id, &voucher.voucher_id)?
                .ok_or(CoreError::VoucherNotFound)?;
            Ok::<_, CoreError>(Redemption {
                voucher_id: redeemed.voucher_id.clone(),
                wallet_id: wallet.wallet_id.clone(),
                wallet_balance: balance,
                bonus_pending,
                selection,
                policy: build_policy_view(&redeemed, balance, config.outcome_mode),
            })
        })?;

        log::info!(
            "voucher {} redeemed by {user_id} (max cashout {:?})",
            redemption.voucher_id,
            redemption.policy.max_cashout
        );
        Ok(redemption)
    }

    pub fn cancel_voucher(&self, ctx: &TenantContext, voucher_id: &str) -> CoreResult<Voucher> {
        require_staff(ctx, "cancel vouchers")?;
        let now = self.now();
        let tenant_id = ctx.tenant_id.as_str();
        self.store.in_transaction(|store| {
            let voucher = store
                .get_voucher(tenant_id, voucher_id)?
                .ok_or(CoreError::VoucherNotFound)?;
            if !store.close_new_voucher(tenant_id, voucher_id, VoucherStatus::Cancelled, now)? {
                return Err(CoreError::VoucherNotRedeemable {
                    status: voucher.status.to_string(),
                });
            }
            store.record_event_best_effort(
                tenant_id,
                &NewLedgerEvent::new(LedgerEventType::VoucherCancelled, now)
                    .action(voucher_id)
                    .amount(to_cents(voucher.amount))
                    .source(LEDGER_SOURCE)
                    .meta(json!({ "voucherId": voucher_id, "cancelledBy": ctx.actor_id })),
            );
            store
                .get_voucher(tenant_id, voucher_id)?
                .ok_or(CoreError::VoucherNotFound)
        })
    }

    /// Sweep NEW vouchers past their expiry. Returns how many expired.
    pub fn expire_vouchers(&self, ctx: &TenantContext) -> CoreResult<usize> {
        let now = self.now();
        let tenant_id = ctx.tenant_id.as_str();
        let expired = self.store.in_transaction(|store| {
            let mut count = 0;
            for voucher in store.vouchers_due_to_expire(tenant_id, now)? {
                if store.close_new_voucher(tenant_id, &voucher.voucher_id, VoucherStatus::Expired, now)? {
                    record_expiry(store, tenant_id, &voucher, now);
                    count += 1;
                }
            }
            Ok::<_, CoreError>(count)
        })?;
        if expired > 0 {
            log::info!("tenant {tenant_id} expired {expired} vouchers");
        }
        Ok(expired)
    }

    fn expire_one(&self, tenant_id: &str, voucher: &Voucher, now: DateTime<Utc>) -> CoreResult<()> {
        self.store.in_transaction(|store| {
            if store.close_new_voucher(tenant_id, &voucher.voucher_id, VoucherStatus::Expired, now)? {
                record_expiry(store, tenant_id, voucher, now);
            }
            Ok::<_, CoreError>(())
        })
    }

    // ── Bet / settle ─────────────────────────────────────────────────────────

    pub fn place_bet(&mut self, ctx: &TenantContext, req: PlaceBet) -> CoreResult<BetReceipt> {
        if !req.stake.is_finite() || req.stake <= 0.0 {
            return Err(CoreError::validation("stake", "must be greater than zero"));
        }
        if req.session_id.trim().is_empty() {
            return Err(CoreError::validation("session_id", "is required"));
        }
        if req.game_key.trim().is_empty() {
            return Err(CoreError::validation("game_key", "is required"));
        }
        if req.user_id.trim().is_empty() {
            return Err(CoreError::validation("user_id", "is required"));
        }
        let tenant_id = ctx.tenant_id.clone();
        let stake = round_money(req.stake);
        let client_action = req.action_id.clone().filter(|a| !a.trim().is_empty());
        let action_id = client_action
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = self.now();

        let system = &self.system;
        let payout_rng = self.payout_rng.as_mut();
        let pure_rng = self.pure_rng.as_mut();
        let settled = self.store.in_transaction(|store| -> CoreResult<RoundResult> {
            if client_action.is_some() {
                if let Some(settlement) = stored_settlement(store, &tenant_id, &action_id)? {
                    return Ok(RoundResult::Replayed(settlement));
                }
            }
            enforce_loss_limit(store, &tenant_id, &req.session_id, to_cents(stake))?;

            let config = effective_config(store, system, &tenant_id)?;
            let wallet = store.find_or_create_wallet(&tenant_id, &req.user_id, DEFAULT_CURRENCY, to_millis(now))?;
            if stake > wallet.balance + 1e-9 {
                return Err(CoreError::InsufficientFunds);
            }
            let balance_before = round_money(wallet.balance);
            let balance_after_bet_expected = round_money(balance_before - stake);

            let voucher = if config.outcome_mode.is_voucher_controlled() {
                resolve_active_voucher_for_wallet(store, &tenant_id, &wallet, &req.user_id, true)?
                    .filter(|v| v.status == VoucherStatus::Redeemed && v.max_cashout() > 0.0)
            } else {
                None
            };

            let outcome: PayoutOutcome = match &voucher {
                Some(v) => compute_payout(
                    &PayoutRequest {
                        stake,
                        balance_before_bet: balance_before,
                        balance_after_bet: balance_after_bet_expected,
                        cap: v.max_cashout(),
                    },
                    &v.policy_state.decay_policy(),
                    payout_rng,
                ),
                None => compute_pure_rng_payout(stake, balance_after_bet_expected, pure_rng),
            };

            let balance_after_bet = store.credit_debit(
                &wallet.wallet_id,
                -stake,
                "bet",
                Some(&action_id),
                Some(&json!({ "gameKey": req.game_key, "sessionId": req.session_id })),
                to_millis(now),
            )?;
            let balance_after = if outcome.payout_amount > 0.0 {
                store.credit_debit(
                    &wallet.wallet_id,
                    outcome.payout_amount,
                    "win",
                    Some(&action_id),
                    Some(&json!({ "gameKey": req.game_key, "mode": outcome.mode })),
                    to_millis(now),
                )?
            } else {
                balance_after_bet
            };

            let settlement = RoundSettlement {
                action_id: action_id.clone(),
                game_key: req.game_key.clone(),
                stake,
                payout: outcome.payout_amount,
                balance_before,
                balance_after_bet,
                balance_after,
                outcome_mode: config.outcome_mode,
                round_mode: outcome.mode,
                reached_or_exceeded_cap: outcome.reached_or_exceeded_cap,
                decay_step: outcome.decay_step,
                voucher_id: voucher.as_ref().map(|v| v.voucher_id.clone()),
                max_cashout: voucher.as_ref().map(|v| v.max_cashout()),
            };
            record_round_events(store, &tenant_id, &req, &settlement, now)?;

            let view = match voucher {
                Some(mut v) => {
                    let next = v.policy_state.apply_round_outcome(RoundUpdate {
                        max_cashout: v.max_cashout(),
                        outcome: &outcome,
                        balance_after_settle: balance_after,
                        now,
                    });
                    store.update_voucher_policy_state(&tenant_id, &v.voucher_id, &next, now)?;
                    v.policy_state = next;
                    Some(build_policy_view(&v, balance_after, config.outcome_mode))
                }
                None => None,
            };
            Ok(RoundResult::Settled(settlement, view))
        });

        let (settlement, voucher) = match settled {
            Ok(RoundResult::Settled(settlement, view)) => (settlement, view),
            Ok(RoundResult::Replayed(settlement)) => {
                log::info!("bet {} replayed from ledger", settlement.action_id);
                return Ok(BetReceipt {
                    settlement,
                    voucher: None,
                    risk: None,
                    safety_action: None,
                    replayed: true,
                });
            }
            Err(CoreError::LossLimitReached(breach)) => {
                let subject = SafetySubject {
                    session_id: &req.session_id,
                    player_id: Some(&req.user_id),
                    game_key: Some(&req.game_key),
                };
                self.note_stop(&tenant_id, subject, &breach, now);
                return Err(CoreError::LossLimitReached(breach));
            }
            Err(e) => return Err(e),
        };
        log::debug!(
            "bet {} stake={} payout={} mode={}",
            settlement.action_id,
            settlement.stake,
            settlement.payout,
            settlement.round_mode.as_str()
        );

        let subject = SafetySubject {
            session_id: &req.session_id,
            player_id: Some(&req.user_id),
            game_key: Some(&req.game_key),
        };
        let (risk, safety_action) = self.assess_after_commit(&tenant_id, subject);
        Ok(BetReceipt {
            settlement,
            voucher,
            risk,
            safety_action,
            replayed: false,
        })
    }

    /// Post-commit risk pass. Failures are logged, never returned.
    fn assess_after_commit(
        &self,
        tenant_id: &str,
        subject: SafetySubject<'_>,
    ) -> (Option<RiskAssessment>, Option<IssuedAction>) {
        let now = self.now();
        let risk = match compute_risk(&self.store, tenant_id, subject.session_id, now) {
            Ok(risk) => risk,
            Err(e) => {
                log::warn!("risk scoring failed for session {}: {e}", subject.session_id);
                return (None, None);
            }
        };
        let action = match maybe_issue_action(&self.store, tenant_id, subject, &risk, now) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("safety action failed for session {}: {e}", subject.session_id);
                None
            }
        };
        (Some(risk), action)
    }

    fn note_stop(
        &mut self,
        tenant_id: &str,
        subject: SafetySubject<'_>,
        breach: &LossLimitBreach,
        now: DateTime<Utc>,
    ) {
        let record = match record_loss_limit_stop(&self.store, tenant_id, subject, breach, now) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("loss-limit STOP audit failed for session {}: {e}", subject.session_id);
                None
            }
        };
        self.last_stop = Some(StopNotice {
            message: STOP_MESSAGE,
            record,
        });
    }

    // ── Safety ───────────────────────────────────────────────────────────────

    pub fn set_loss_limit(
        &self,
        ctx: &TenantContext,
        session_id: &str,
        loss_limit_cents: Cents,
    ) -> CoreResult<SafetyLimit> {
        let limit = set_loss_limit(
            &self.store,
            &ctx.tenant_id,
            session_id,
            ctx.actor_id.as_deref(),
            loss_limit_cents,
            self.now(),
        )?;
        log::info!("session {session_id} loss limit now {}", limit.loss_limit_cents);
        Ok(limit)
    }

    /// Record one telemetry event, gate on the loss limit, then score.
    pub fn record_telemetry(
        &mut self,
        ctx: &TenantContext,
        session_id: &str,
        payload: TelemetryPayload,
    ) -> CoreResult<TelemetryOutcome> {
        if session_id.trim().is_empty() {
            return Err(CoreError::validation("session_id", "is required"));
        }
        let now = self.now();
        let tenant_id = ctx.tenant_id.clone();
        let event_type = LedgerEventType::parse(payload.event_type.as_deref().unwrap_or(""));

        let mut event = NewLedgerEvent::new(event_type, now)
            .session(session_id)
            .source("telemetry");
        event.client_ts = payload.client_ts;
        event.player_id = ctx.actor_id.clone();
        event.game_key = payload.game_key.clone().filter(|g| !g.is_empty());
        event.action_id = payload.action_id.clone().filter(|a| !a.is_empty());
        event.bet_cents = payload.bet_cents;
        event.win_cents = payload.win_cents;
        event.balance_cents = payload.balance_cents;
        event.meta = payload.meta.clone();
        let recorded = self.store.record_event(&tenant_id, &event)?;

        let subject = SafetySubject {
            session_id,
            player_id: ctx.actor_id.as_deref(),
            game_key: payload.game_key.as_deref(),
        };
        // The row above is already part of the session's net loss.
        if let Err(e) = enforce_loss_limit(&self.store, &tenant_id, session_id, 0) {
            if let CoreError::LossLimitReached(breach) = &e {
                self.note_stop(&tenant_id, subject, breach, now);
            }
            return Err(e);
        }

        let risk = compute_risk(&self.store, &tenant_id, session_id, now)?;
        let action = maybe_issue_action(&self.store, &tenant_id, subject, &risk, now)?;
        Ok(TelemetryOutcome {
            event: recorded,
            risk,
            action,
        })
    }

    // ── Projections ──────────────────────────────────────────────────────────

    /// Read-only voucher policy projection for the user's wallet.
    pub fn wallet_voucher_state(
        &self,
        ctx: &TenantContext,
        user_id: &str,
    ) -> CoreResult<Option<VoucherPolicyView>> {
        let config = self.effective_config(ctx)?;
        let Some(wallet) = self.store.find_wallet(&ctx.tenant_id, user_id, DEFAULT_CURRENCY)? else {
            return Ok(None);
        };
        resolve_wallet_voucher_policy_state(
            &self.store,
            &ctx.tenant_id,
            &wallet,
            &user_id.to_string(),
            config.outcome_mode,
        )
    }

    pub fn wallet_balance(&self, ctx: &TenantContext, user_id: &str) -> CoreResult<Money> {
        Ok(self
            .store
            .find_wallet(&ctx.tenant_id, user_id, DEFAULT_CURRENCY)?
            .map(|w| w.balance)
            .unwrap_or(0.0))
    }
}

fn require_staff(ctx: &TenantContext, action: &'static str) -> CoreResult<()> {
    if ctx.role.is_staff() {
        Ok(())
    } else {
        Err(CoreError::Forbidden {
            role: ctx.role.as_str(),
            action,
        })
    }
}

fn record_expiry(store: &CoreStore, tenant_id: &str, voucher: &Voucher, now: DateTime<Utc>) {
    store.record_event_best_effort(
        tenant_id,
        &NewLedgerEvent::new(LedgerEventType::VoucherExpired, now)
            .action(voucher.voucher_id.clone())
            .amount(to_cents(voucher.amount))
            .source(LEDGER_SOURCE)
            .meta(json!({ "voucherId": voucher.voucher_id })),
    );
}

/// The settlement stored on the tenant's SPIN row for `action_id`.
fn stored_settlement(
    store: &CoreStore,
    tenant_id: &str,
    action_id: &str,
) -> CoreResult<Option<RoundSettlement>> {
    let Some(spin) = store.find_event_by_action(tenant_id, action_id, &LedgerEventType::Spin)? else {
        return Ok(None);
    };
    spin.meta
        .and_then(|m| m.get("settlement").cloned())
        .and_then(|s| serde_json::from_value::<RoundSettlement>(s).ok())
        .map(Some)
        .ok_or_else(|| {
            CoreError::validation("action_id", "already used by a round that cannot be replayed")
        })
}

/// BET, WIN (only for a non-zero payout) and SPIN for one round.
///
/// These rows feed the loss-limit gate and risk scoring, so a failed
/// insert fails the round.
fn record_round_events(
    store: &CoreStore,
    tenant_id: &str,
    req: &PlaceBet,
    settlement: &RoundSettlement,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let base = |event_type: LedgerEventType| {
        NewLedgerEvent::new(event_type, now)
            .player(req.user_id.clone())
            .session(req.session_id.clone())
            .action(settlement.action_id.clone())
            .game(req.game_key.clone())
            .source(LEDGER_SOURCE)
    };
    let bet_cents = to_cents(settlement.stake);
    let win_cents = to_cents(settlement.payout);

    store.record_event(
        tenant_id,
        &base(LedgerEventType::Bet)
            .amount(bet_cents)
            .bet(bet_cents)
            .balance(to_cents(settlement.balance_after_bet)),
    )?;
    if win_cents > 0 {
        store.record_event(
            tenant_id,
            &base(LedgerEventType::Win)
                .amount(win_cents)
                .win(win_cents)
                .balance(to_cents(settlement.balance_after)),
        )?;
    }
    store.record_event(
        tenant_id,
        &base(LedgerEventType::Spin)
            .bet(bet_cents)
            .win(win_cents)
            .balance(to_cents(settlement.balance_after))
            .meta(json!({ "settlement": serde_json::to_value(settlement)? })),
    )?;
    Ok(())
}
