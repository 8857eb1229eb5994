use clap::{Parser, Subcommand, ValueEnum};
use kirppu::{
    error::Result,
    ledger::PayoutDecision,
    listing::{ConformityVerdict, ModerationDecision},
    notify::Notifier,
    settlement::{ScanMode, SettlementService},
    AppConfig, Database,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kirppu-counter")]
#[command(about = "Store counter and back-office operations for the kirppu marketplace")]
struct Args {
    /// Path to a TOML config file; defaults are used when absent
    #[arg(short, long, default_value = "kirppu.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a logistics code at the store counter
    Scan {
        #[arg(value_enum)]
        mode: ScanModeArg,
        code: String,
    },
    /// Approve or reject a pending listing
    Moderate {
        listing_id: Uuid,
        #[arg(value_enum)]
        decision: DecisionArg,
        #[arg(long)]
        moderator: Uuid,
    },
    /// Record the conformity inspection verdict for a listing
    Conformity {
        listing_id: Uuid,
        #[arg(value_enum)]
        verdict: VerdictArg,
        #[arg(long)]
        inspector: Uuid,
    },
    /// List pending payout requests
    Payouts,
    /// Complete a pending payout request
    CompletePayout {
        request_id: Uuid,
        #[arg(long)]
        operator: Uuid,
    },
    /// Reject a pending payout request
    RejectPayout {
        request_id: Uuid,
        #[arg(long)]
        operator: Uuid,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanModeArg {
    Deposit,
    Quality,
    Withdrawal,
}

#[derive(Clone, Copy, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Conforme,
    NonConforme,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = if std::path::Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        AppConfig::default()
    };
    config.validate()?;

    let db = Database::new(config.get_database_url()).await?;
    let notifier = Notifier::default();
    let (listings, _negotiation, ledger, settlement) =
        SettlementService::assemble(db, notifier);

    match args.command {
        Command::Scan { mode, code } => {
            let mode = match mode {
                ScanModeArg::Deposit => ScanMode::VerifyDeposit,
                ScanModeArg::Quality => ScanMode::QualityCheck,
                ScanModeArg::Withdrawal => ScanMode::ProcessWithdrawal,
            };
            let listing = settlement.scan(mode, code.trim()).await?;
            println!(
                "{} \"{}\" -> {}",
                listing.id,
                listing.title,
                listing.logistics.as_str()
            );
        }
        Command::Moderate {
            listing_id,
            decision,
            moderator,
        } => {
            let decision = match decision {
                DecisionArg::Approve => ModerationDecision::Approve,
                DecisionArg::Reject => ModerationDecision::Reject,
            };
            let listing = listings.moderate(listing_id, decision, moderator).await?;
            println!(
                "{} -> {} (deposit code: {}, withdrawal code: {})",
                listing.id,
                listing.moderation.as_str(),
                listing.deposit_code.as_deref().unwrap_or("-"),
                listing.withdrawal_code.as_deref().unwrap_or("-"),
            );
        }
        Command::Conformity {
            listing_id,
            verdict,
            inspector,
        } => {
            let verdict = match verdict {
                VerdictArg::Conforme => ConformityVerdict::Conforme,
                VerdictArg::NonConforme => ConformityVerdict::NonConforme,
            };
            let listing = listings
                .assess_conformity(listing_id, verdict, inspector)
                .await?;
            println!(
                "{} conformity: {} (moderation: {})",
                listing.id,
                listing.conformity.as_str(),
                listing.moderation.as_str()
            );
        }
        Command::Payouts => {
            let payouts = ledger
                .list_payouts(Some(kirppu::model::PayoutStatus::Pending))
                .await?;
            if payouts.is_empty() {
                println!("no pending payout requests");
            }
            for payout in payouts {
                println!(
                    "{} user {} {:.2} -> {}",
                    payout.id, payout.user_id, payout.amount, payout.account_ref
                );
            }
        }
        Command::CompletePayout {
            request_id,
            operator,
        } => {
            let payout = ledger
                .process_payout(request_id, PayoutDecision::Complete, operator)
                .await?;
            println!("{} -> {}", payout.id, payout.status.as_str());
        }
        Command::RejectPayout {
            request_id,
            operator,
            reason,
        } => {
            let payout = ledger
                .process_payout(request_id, PayoutDecision::Reject(reason), operator)
                .await?;
            println!("{} -> {}", payout.id, payout.status.as_str());
        }
    }

    Ok(())
}
