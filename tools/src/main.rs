//! round-runner: headless driver for the wager engine.
//!
//! Usage:
//!   round-runner --seed 12345 --rounds 200 --stake 2 --amount 100 --db run.db
//!   round-runner --seed 12345 --ipc-mode

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use wager_core::{
    clock::{ManualClock, SystemClock},
    config::SystemConfig,
    context::{ActorRole, TenantContext},
    engine::{IssueVoucher, PlaceBet, TelemetryPayload, WagerEngine},
    error::CoreError,
    payout::RoundMode,
    rng::RngBank,
    store::CoreStore,
    voucher::CapRequest,
};

const TENANT: &str = "demo";
const PLAYER: &str = "player-1";
const SESSION: &str = "session-1";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Issue {
        amount: f64,
        #[serde(default)]
        bonus_amount: f64,
        #[serde(default)]
        cap: CapRequest,
    },
    Redeem {
        user_id: String,
        #[serde(default)]
        session_id: Option<String>,
        code: String,
        pin: String,
    },
    Bet {
        user_id: String,
        session_id: String,
        game_key: String,
        stake: f64,
        #[serde(default)]
        action_id: Option<String>,
    },
    SetLossLimit {
        user_id: String,
        session_id: String,
        loss_limit_cents: i64,
    },
    Telemetry {
        user_id: String,
        session_id: String,
        #[serde(default)]
        payload: TelemetryPayload,
    },
    GetState {
        user_id: String,
    },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let rounds = parse_arg(&args, "--rounds", 100u32);
    let stake = parse_arg(&args, "--stake", 1.0f64);
    let amount = parse_arg(&args, "--amount", 100.0f64);
    let interval_ms = parse_arg(&args, "--interval-ms", 4_000i64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = str_arg(&args, "--data-dir").unwrap_or("./data");

    let system = match SystemConfig::load(data_dir) {
        Ok(system) => system,
        Err(e) => {
            log::warn!("{e}; using built-in defaults");
            SystemConfig::default_test()
        }
    };
    let store = if db == ":memory:" {
        CoreStore::in_memory()?
    } else {
        CoreStore::open(db)?
    };
    store.migrate()?;

    if ipc_mode {
        let mut engine = WagerEngine::new(store, system, RngBank::seeded(seed), Arc::new(SystemClock));
        ensure_tenant(&engine)?;
        return run_ipc_loop(&mut engine);
    }

    println!("round-runner");
    println!("  seed:      {seed}");
    println!("  rounds:    {rounds}");
    println!("  stake:     {stake}");
    println!("  voucher:   {amount}");
    println!("  db:        {db}");
    println!();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut engine = WagerEngine::new(store, system, RngBank::seeded(seed), clock.clone());
    ensure_tenant(&engine)?;
    run_batch(&mut engine, &clock, rounds, stake, amount, interval_ms)
}

fn ensure_tenant(engine: &WagerEngine) -> Result<()> {
    if !engine.store().tenant_exists(TENANT)? {
        engine.create_tenant(TENANT, "Demo tenant")?;
    }
    Ok(())
}

fn staff() -> TenantContext {
    TenantContext::staff(TENANT, ActorRole::Operator, "round-runner")
}

fn run_batch(
    engine: &mut WagerEngine,
    clock: &ManualClock,
    rounds: u32,
    stake: f64,
    amount: f64,
    interval_ms: i64,
) -> Result<()> {
    let player = TenantContext::player(TENANT, PLAYER);
    let issued = engine.issue_voucher(
        &staff(),
        IssueVoucher {
            amount,
            bonus_amount: 0.0,
            currency: None,
            expires_at: None,
            cap: CapRequest::default(),
        },
    )?;
    let redemption =
        engine.redeem_voucher(&player, PLAYER, Some(SESSION), &issued.voucher.code, &issued.pin)?;

    let mut played = 0u32;
    let mut wins = 0u32;
    let mut decay_rounds = 0u32;
    let mut peak = redemption.wallet_balance;
    let mut actions = Vec::new();
    for i in 0..rounds {
        clock.advance(Duration::milliseconds(interval_ms));
        let receipt = match engine.place_bet(
            &player,
            PlaceBet {
                user_id: PLAYER.to_string(),
                session_id: SESSION.to_string(),
                game_key: format!("game-{}", i % 3),
                stake,
                action_id: None,
            },
        ) {
            Ok(receipt) => receipt,
            Err(CoreError::InsufficientFunds) => {
                println!("  balance exhausted after {played} rounds");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        played += 1;
        let s = &receipt.settlement;
        if s.payout > 0.0 {
            wins += 1;
        }
        if s.round_mode == RoundMode::Decay {
            decay_rounds += 1;
        }
        peak = peak.max(s.balance_after);
        if let Some(action) = receipt.safety_action {
            actions.push(format!("round {}: {}", i + 1, action.action_type.as_str()));
        }
    }

    let balance = engine.wallet_balance(&player, PLAYER)?;
    println!("=== RUN SUMMARY ===");
    println!("  rounds played:  {played}");
    println!("  winning rounds: {wins}");
    println!("  decay rounds:   {decay_rounds}");
    println!("  max cashout:    {:?}", redemption.policy.max_cashout);
    println!("  peak balance:   {peak:.2}");
    println!("  final balance:  {balance:.2}");
    println!("  safety actions: {}", actions.len());
    for action in actions {
        println!("    {action}");
    }
    Ok(())
}

fn run_ipc_loop(engine: &mut WagerEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = json!({ "ok": false, "error": { "code": "BAD_COMMAND", "message": e.to_string() } });
                writeln!(stdout, "{err_json}")?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let reply = match handle_command(engine, cmd) {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => error_reply(engine, &e),
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(engine: &mut WagerEngine, cmd: IpcCommand) -> Result<Value, CoreError> {
    let value = match cmd {
        IpcCommand::Issue {
            amount,
            bonus_amount,
            cap,
        } => {
            let issued = engine.issue_voucher(
                &staff(),
                IssueVoucher {
                    amount,
                    bonus_amount,
                    currency: None,
                    expires_at: None,
                    cap,
                },
            )?;
            json!({
                "voucherId": issued.voucher.voucher_id,
                "code": issued.voucher.code,
                "pin": issued.pin,
                "amount": issued.voucher.amount,
                "bonusAmount": issued.voucher.bonus_amount,
            })
        }
        IpcCommand::Redeem {
            user_id,
            session_id,
            code,
            pin,
        } => {
            let ctx = TenantContext::player(TENANT, user_id.clone());
            serde_json::to_value(engine.redeem_voucher(
                &ctx,
                &user_id,
                session_id.as_deref(),
                &code,
                &pin,
            )?)?
        }
        IpcCommand::Bet {
            user_id,
            session_id,
            game_key,
            stake,
            action_id,
        } => {
            let ctx = TenantContext::player(TENANT, user_id.clone());
            serde_json::to_value(engine.place_bet(
                &ctx,
                PlaceBet {
                    user_id,
                    session_id,
                    game_key,
                    stake,
                    action_id,
                },
            )?)?
        }
        IpcCommand::SetLossLimit {
            user_id,
            session_id,
            loss_limit_cents,
        } => {
            let ctx = TenantContext::player(TENANT, user_id);
            serde_json::to_value(engine.set_loss_limit(&ctx, &session_id, loss_limit_cents)?)?
        }
        IpcCommand::Telemetry {
            user_id,
            session_id,
            payload,
        } => {
            let ctx = TenantContext::player(TENANT, user_id);
            serde_json::to_value(engine.record_telemetry(&ctx, &session_id, payload)?)?
        }
        IpcCommand::GetState { user_id } => {
            let ctx = TenantContext::player(TENANT, user_id.clone());
            json!({
                "balance": engine.wallet_balance(&ctx, &user_id)?,
                "voucher": engine.wallet_voucher_state(&ctx, &user_id)?,
                "config": {
                    "outcomeMode": engine.effective_config(&ctx)?.outcome_mode,
                },
            })
        }
        IpcCommand::Quit => Value::Null,
    };
    Ok(value)
}

fn error_reply(engine: &mut WagerEngine, e: &CoreError) -> Value {
    let mut error = json!({
        "code": e.code(),
        "status": e.http_status(),
        "message": e.to_string(),
    });
    if let Some(breach) = e.loss_limit_breach() {
        error["evidence"] = json!(breach);
        if let Some(stop) = engine.take_last_stop() {
            error["safetyAction"] = json!(stop);
        }
    }
    json!({ "ok": false, "error": error })
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
