//! Detailed per-cycle text log.
//!
//! Appends one human-readable block per cycle with the prompts, the chain
//! of thought, every decision, and its execution outcome. This is the
//! operator's post-mortem record; failures to write are logged and ignored.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use crate::types::{FullDecision, TradeContext};

pub struct CycleLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CycleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append one cycle block. `note` carries loop-level context such as
    /// risk rejections or sweep actions.
    pub fn append(&self, ctx: &TradeContext, decision: Option<&FullDecision>, note: &str) {
        let mut block = String::new();
        block.push_str(&format!(
            "\n================ cycle #{} | {} ================\n",
            ctx.cycle, ctx.current_time
        ));
        block.push_str(&format!(
            "account: equity {:.2} | available {:.2} | pnl {:+.2}% | margin {:.1}% | positions {} | sharpe {:.2}\n",
            ctx.account.total_equity,
            ctx.account.available_balance,
            ctx.account.realized_pnl_pct,
            ctx.account.margin_used_pct,
            ctx.account.position_count,
            ctx.sharpe_ratio,
        ));

        if !note.is_empty() {
            block.push_str(&format!("note: {note}\n"));
        }

        if let Some(fd) = decision {
            block.push_str("\n--- chain of thought ---\n");
            block.push_str(&fd.cot_trace);
            block.push('\n');

            if fd.decisions.is_empty() {
                block.push_str("decisions: none (wait)\n");
            } else {
                block.push_str("\n--- decisions ---\n");
                for d in &fd.decisions {
                    block.push_str(&format!(
                        "{} {} | size {:.2} | lev {}x | SL {:.4} | TP {:.4}",
                        d.symbol,
                        d.action,
                        d.position_size_usd,
                        d.leverage,
                        d.stop_loss,
                        d.take_profit,
                    ));
                    match (&d.exec_status, &d.exec_error) {
                        (Some(status), Some(err)) => {
                            block.push_str(&format!(" -> {status:?}: {err}"))
                        }
                        (Some(status), None) => block.push_str(&format!(" -> {status:?}")),
                        _ => {}
                    }
                    block.push('\n');
                }
            }

            block.push_str(&format!(
                "\n--- prompts ({} + {} chars) ---\n",
                fd.system_prompt.len(),
                fd.user_prompt.len()
            ));
            block.push_str(&fd.user_prompt);
            block.push('\n');
        }

        let _guard = self.lock.lock().expect("cycle log lock poisoned");
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(block.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "cycle log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Decision, DecisionAction, ExecStatus};

    #[test]
    fn appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.log");
        let log = CycleLog::new(&path);

        let mut ctx = TradeContext::default();
        ctx.cycle = 1;
        ctx.current_time = "2024-06-01 10:00:00".into();
        log.append(&ctx, None, "advisor unavailable");

        let mut fd = FullDecision::default();
        fd.cot_trace = "thinking hard".into();
        fd.decisions.push(Decision {
            symbol: "BTCUSDT".into(),
            action: DecisionAction::OpenLong,
            exec_status: Some(ExecStatus::Success),
            ..Default::default()
        });
        ctx.cycle = 2;
        log.append(&ctx, Some(&fd), "");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("cycle #1"));
        assert!(content.contains("advisor unavailable"));
        assert!(content.contains("cycle #2"));
        assert!(content.contains("thinking hard"));
        assert!(content.contains("BTCUSDT open_long"));
        assert!(content.contains("Success"));
    }
}
