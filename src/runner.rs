use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::classify::retry_delay;
use crate::connection::Connection;
use crate::{CommitResult, Context, Error, ErrorClassifier, Shared, TransactionContext};

/// An attempt aborted by the server, which may have suggested when to try again.
struct Aborted {
    retry_delay: Option<Duration>,
}

fn aborted(classifier: &ErrorClassifier, err: &(dyn std::error::Error + 'static)) -> Option<Aborted> {
    let classification = classifier.classify(err);
    if classification.is_abort() {
        Some(Aborted {
            retry_delay: classification.cause.and_then(retry_delay),
        })
    } else {
        None
    }
}

/// Runs `body` in read/write transactions until one of them commits.
///
/// Attempts aborted by the server, whether by the body or by the commit, are retried with a new
/// transaction on the same session. Any other error rolls the transaction back and is returned as
/// it is.
pub(crate) async fn run<T, E, F>(
    connection: &(dyn Connection + 'static),
    shared: &Arc<Shared>,
    ctx: &Context,
    mut body: F,
) -> Result<CommitResult<T>, E>
where
    F: for<'t> FnMut(&'t mut TransactionContext) -> BoxFuture<'t, Result<T, E>>,
    E: std::error::Error + From<Error> + Send + 'static,
{
    let mut session = shared.session(ctx).await?;
    let mut attempt = 0;
    loop {
        ctx.check()?;
        let mut tx = TransactionContext::new(
            dyn_clone::clone_box(connection),
            shared.clone(),
            session,
            ctx.clone(),
            attempt,
        );

        let (err, abort) = match body(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(timestamp) => {
                    return Ok(CommitResult {
                        value,
                        timestamp,
                        attempts: attempt + 1,
                    })
                }
                Err(err) => {
                    let abort = aborted(&shared.classifier, &err);
                    (E::from(err), abort)
                }
            },
            Err(err) => {
                let abort = aborted(&shared.classifier, &err);
                (err, abort)
            }
        };

        match abort {
            Some(Aborted { retry_delay }) => {
                let delay = retry_delay.unwrap_or_else(|| shared.backoff.delay(attempt as u32));
                log::debug!(
                    "transaction attempt {} aborted, retrying in {:?}: {}",
                    attempt,
                    delay,
                    err
                );
                session = tx.into_session();
                ctx.sleep(delay).await?;
                attempt += 1;
            }
            None => {
                tx.rollback().await;
                return Err(err);
            }
        }
    }
}
