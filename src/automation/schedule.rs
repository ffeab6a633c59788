use chrono::Local;
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Classic 5 field expressions get a leading seconds field.
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

pub(super) fn spawn<H>(expression: &str, handler: H) -> crate::Result<JoinHandle<()>>
where
    H: Fn() + Send + Sync + 'static,
{
    let schedule = Schedule::from_str(&normalize_cron(expression))?;
    info!("Scheduling cron trigger '{}'", expression);

    Ok(tokio::spawn(async move {
        loop {
            let next = match schedule.upcoming(Local).next() {
                Some(next) => next,
                None => {
                    debug!("Cron schedule exhausted");
                    break;
                }
            };
            let delay = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            handler();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_five_fields() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" 0 30 7 * * * "), "0 30 7 * * *");
    }

    #[test]
    fn accepts_both_forms() {
        assert!(Schedule::from_str(&normalize_cron("*/5 * * * *")).is_ok());
        assert!(Schedule::from_str(&normalize_cron("0 0 12 * * Mon-Fri")).is_ok());
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(spawn("every tuesday", || {}).is_err());
    }
}
