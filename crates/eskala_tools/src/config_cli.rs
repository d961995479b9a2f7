#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use eskala_kernel_contracts::actor::{ActorContext, UserId};
use eskala_kernel_contracts::versioned::EntryVersion;
use eskala_kernel_contracts::Timestamp;
use eskala_os::fx_rates::{parse_effective_date, parse_rate, CurrencyPair};
use eskala_os::runtime::EskalaRuntime;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "eskala", about = "Versioned formula and exchange-rate administration")]
pub struct Cli {
    /// Numeric id of the user making the change.
    #[arg(long, global = true)]
    pub actor_id: Option<u64>,
    /// Display name recorded with the change.
    #[arg(long, global = true)]
    pub actor_name: Option<String>,
    /// Print read results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(subcommand)]
    Formula(FormulaCommand),
    #[command(subcommand)]
    Fx(FxCommand),
}

#[derive(Debug, Subcommand)]
pub enum FormulaCommand {
    /// Active formulas.
    List,
    Show { key: String },
    History { key: String },
    /// Recent changes across all formulas.
    Changes {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Seed {
        key: String,
        expression: String,
        #[arg(long)]
        description: Option<String>,
    },
    Set {
        key: String,
        expression: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        expected_version: Option<u32>,
    },
    /// Evaluate the current expression, e.g. `--var investment_l=5000`.
    Eval {
        key: String,
        #[arg(long = "var")]
        vars: Vec<String>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct PairArgs {
    #[arg(long, default_value = "HNL")]
    pub from: String,
    #[arg(long, default_value = "USD")]
    pub to: String,
}

impl PairArgs {
    fn pair(&self) -> Result<CurrencyPair, String> {
        CurrencyPair::new(&self.from, &self.to).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Subcommand)]
pub enum FxCommand {
    Current {
        #[command(flatten)]
        pair: PairArgs,
    },
    All {
        #[command(flatten)]
        pair: PairArgs,
    },
    History {
        #[command(flatten)]
        pair: PairArgs,
    },
    /// Rate valid at a date (RFC 3339 or `YYYY-MM-DD HH:MM:SS`).
    At {
        date: String,
        #[command(flatten)]
        pair: PairArgs,
    },
    Seed {
        rate: String,
        #[command(flatten)]
        pair: PairArgs,
    },
    Set {
        rate: String,
        #[arg(long)]
        effective: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        expected_version: Option<u32>,
        #[command(flatten)]
        pair: PairArgs,
    },
}

pub fn actor_from_args(actor_id: Option<u64>, actor_name: Option<String>) -> Result<ActorContext, String> {
    ActorContext::v1(actor_id.map(UserId), actor_name).map_err(|e| format!("invalid actor: {e}"))
}

fn fmt_ts(ts: &Timestamp) -> String {
    ts.to_rfc3339()
}

fn fmt_opt_ts(ts: &Option<Timestamp>) -> String {
    ts.as_ref().map(fmt_ts).unwrap_or_else(|| "-".to_string())
}

fn render<T: Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> Result<String, String> {
    if json {
        serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))
    } else {
        Ok(text(value))
    }
}

fn parse_binding(raw: &str) -> Result<(String, Decimal), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = Decimal::from_str(value.trim())
        .map_err(|_| format!("value for '{}' is not a number", name.trim()))?;
    Ok((name.trim().to_string(), value))
}

pub fn execute_config_command(
    runtime: &EskalaRuntime,
    command: &ConfigCommand,
    actor: ActorContext,
    json: bool,
) -> Result<String, String> {
    match command {
        ConfigCommand::Formula(cmd) => execute_formula_command(runtime, cmd, actor, json),
        ConfigCommand::Fx(cmd) => execute_fx_command(runtime, cmd, actor, json),
    }
}

fn execute_formula_command(
    runtime: &EskalaRuntime,
    command: &FormulaCommand,
    actor: ActorContext,
    json: bool,
) -> Result<String, String> {
    let formulas = runtime.formulas();
    match command {
        FormulaCommand::List => {
            let rows = formulas.active().map_err(|e| e.to_string())?;
            render(json, &rows, |rows| {
                rows.iter()
                    .map(|f| format!("{}\t{}\t{}", f.formula_key, f.status, f.expression))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FormulaCommand::Show { key } => {
            let current = formulas.current(key).map_err(|e| e.to_string())?;
            if json {
                return render(true, &current, |_| String::new());
            }
            let vars = eskala_os::formula_expr::FormulaExpression::parse(current.value.as_str())
                .map(|f| f.describe_variables())
                .unwrap_or_default();
            Ok(format!(
                "{} v{} (since {})\n{}\n{}",
                current.key.as_str(),
                current.version.0,
                fmt_ts(&current.valid_from),
                current.value.as_str(),
                vars
            ))
        }
        FormulaCommand::History { key } => {
            let rows = formulas.history(key).map_err(|e| e.to_string())?;
            render(json, &rows, |rows| {
                rows.iter()
                    .map(|v| {
                        format!(
                            "v{}\t{}\t{}\t{}\t{}\t{}",
                            v.version.0,
                            fmt_ts(&v.effective_from),
                            fmt_opt_ts(&v.effective_to),
                            v.changed_by,
                            v.change_reason,
                            v.expression
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FormulaCommand::Changes { limit } => {
            let rows = formulas.changes(*limit).map_err(|e| e.to_string())?;
            render(json, &rows, |rows| {
                rows.iter()
                    .map(|c| {
                        format!(
                            "{}\tv{}->v{}\t{}\t{}\t{}\t{} => {}",
                            c.formula_key,
                            c.old_version,
                            c.new_version,
                            fmt_opt_ts(&c.changed_at),
                            c.changed_by,
                            c.change_reason,
                            c.old_expression,
                            c.new_expression
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FormulaCommand::Seed {
            key,
            expression,
            description,
        } => {
            let entry = formulas
                .seed(key, expression, description.clone())
                .map_err(|e| e.to_string())?;
            Ok(format!("OK {} v{}", entry.key.as_str(), entry.version.0))
        }
        FormulaCommand::Set {
            key,
            expression,
            reason,
            expected_version,
        } => {
            let out = formulas
                .update(key, expression, reason, actor, expected_version.map(EntryVersion))
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "OK {key} v{} -> v{}",
                out.old_version().0,
                out.new_version().0
            ))
        }
        FormulaCommand::Eval { key, vars } => {
            let bindings = vars
                .iter()
                .map(|raw| parse_binding(raw))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            let value = formulas.evaluate(key, &bindings).map_err(|e| e.to_string())?;
            Ok(value.to_string())
        }
    }
}

fn execute_fx_command(
    runtime: &EskalaRuntime,
    command: &FxCommand,
    actor: ActorContext,
    json: bool,
) -> Result<String, String> {
    let fx = runtime.fx_rates();
    match command {
        FxCommand::Current { pair } => {
            let rate = fx.current_or_default(&pair.pair()?).map_err(|e| e.to_string())?;
            render(json, &rate, |r| {
                let suffix = if r.is_default { " (default)" } else { "" };
                format!("{} {}{suffix}", r.pair, r.rate)
            })
        }
        FxCommand::All { pair } => {
            let rows = fx.all(&pair.pair()?).map_err(|e| e.to_string())?;
            render(json, &rows, |rows| {
                rows.iter()
                    .map(|r| {
                        format!(
                            "{}\t{}\t{}",
                            r.rate,
                            fmt_ts(&r.valid_from),
                            fmt_opt_ts(&r.valid_to)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FxCommand::History { pair } => {
            let rows = fx.change_history(&pair.pair()?).map_err(|e| e.to_string())?;
            render(json, &rows, |rows| {
                rows.iter()
                    .map(|c| {
                        format!(
                            "{}\t{} -> {}\t{}\t{}",
                            fmt_ts(&c.effective_date),
                            c.old_rate
                                .map(|r| r.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                            c.new_rate,
                            c.changed_by.as_deref().unwrap_or("-"),
                            c.reason.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FxCommand::At { date, pair } => {
            let at = parse_effective_date(date).map_err(|e| e.to_string())?;
            let rate = fx.rate_at(&pair.pair()?, at).map_err(|e| e.to_string())?;
            render(json, &rate, |r| format!("{} {}", r.pair, r.rate))
        }
        FxCommand::Seed { rate, pair } => {
            let rate = parse_rate(rate).map_err(|e| e.to_string())?;
            let seeded = fx.seed(&pair.pair()?, rate).map_err(|e| e.to_string())?;
            Ok(format!("OK {} {}", seeded.pair, seeded.rate))
        }
        FxCommand::Set {
            rate,
            effective,
            reason,
            expected_version,
            pair,
        } => {
            let rate = parse_rate(rate).map_err(|e| e.to_string())?;
            let effective_at = parse_effective_date(effective).map_err(|e| e.to_string())?;
            let pair = pair.pair()?;
            let out = fx
                .update(
                    &pair,
                    rate,
                    effective_at,
                    reason,
                    actor,
                    expected_version.map(EntryVersion),
                )
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "OK {pair} v{} -> v{}",
                out.old_version().0,
                out.new_version().0
            ))
        }
    }
}
