//! The staged execution pipeline: the one place in the driver that creates
//! and destroys implicit sessions, selects servers, and re-attempts failed
//! operations. Every operation the client runs goes through here exactly
//! once.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::session::TransactionState;
use crate::{
    error::{
        Error,
        ErrorKind,
        Result,
        MMAPV1_RETRY_WRITES_ERROR_CODE,
        NO_WRITES_PERFORMED,
    },
    operation::{Aspect, Operation, Retryability},
    runtime,
    sdam::SelectedServer,
    selection_criteria::{ReadPreference, SelectionCriteria},
    Client,
    ClientSession,
};

/// The fixed stage order of the pipeline. Stages share one
/// `run(context) -> outcome` contract and are dispatched by the interpreter
/// loop in [`Client::execute_operation_with_cancellation`]; a failing stage
/// aborts the later ones, while session cleanup still runs.
const PIPELINE: &[Stage] = &[
    Stage::Connect,
    Stage::BindSession,
    Stage::SelectServer,
    Stage::Invoke,
];

#[derive(Clone, Copy, Debug)]
enum Stage {
    /// Establish the topology if the client has not connected yet.
    Connect,

    /// Create or validate the session and resolve the read preference.
    BindSession,

    /// Choose a selector and ask the topology for a server.
    SelectServer,

    /// Run the operation with the retry policy applied.
    Invoke,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::BindSession => "bind-session",
            Stage::SelectServer => "select-server",
            Stage::Invoke => "invoke",
        }
    }

    async fn run<T: Operation>(
        &self,
        cx: &mut ExecutionContext<'_, T>,
    ) -> Result<StageFlow<T::O>> {
        match self {
            Stage::Connect => connect(cx).await,
            Stage::BindSession => bind_session(cx).await,
            Stage::SelectServer => select_server(cx).await,
            Stage::Invoke => invoke(cx).await,
        }
    }
}

enum StageFlow<O> {
    /// Proceed to the next stage.
    Continue,

    /// The operation produced its result; no further stages run.
    Finished(O),
}

/// The mutable state threaded through one pipeline run. Exclusively owned by
/// the task executing that run; never shared across concurrent operations.
struct ExecutionContext<'a, T: Operation> {
    client: Client,
    operation: &'a mut T,
    session: SessionBinding<'a>,

    /// The ownership token for this run. An implicit session tagged with it
    /// is ended by this run's cleanup and by nothing else.
    owner: Uuid,

    /// The resolved read preference, set during session binding.
    effective_criteria: SelectionCriteria,

    /// The selector used for the initial selection, reused for the retry.
    selector: Option<SelectionCriteria>,

    server: Option<SelectedServer>,
    in_transaction: bool,
}

enum SessionBinding<'a> {
    None,
    Implicit(ClientSession),
    Explicit(&'a mut ClientSession),
}

impl SessionBinding<'_> {
    fn as_ref(&self) -> Option<&ClientSession> {
        match self {
            SessionBinding::None => None,
            SessionBinding::Implicit(session) => Some(session),
            SessionBinding::Explicit(session) => Some(session),
        }
    }

    fn as_mut(&mut self) -> Option<&mut ClientSession> {
        match self {
            SessionBinding::None => None,
            SessionBinding::Implicit(session) => Some(session),
            SessionBinding::Explicit(session) => Some(session),
        }
    }
}

impl Client {
    /// Executes an operation, creating an implicit session for it if needed.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        operation: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        self.execute_operation_with_cancellation(operation, session, CancellationToken::new())
            .await
    }

    /// Executes an operation, honoring cooperative cancellation: when
    /// `cancellation` fires, the pipeline stops at its next suspension point
    /// and rejects, though an operation outcome that has already settled
    /// still wins.
    pub(crate) async fn execute_operation_with_cancellation<T: Operation>(
        &self,
        operation: &mut T,
        session: Option<&mut ClientSession>,
        cancellation: CancellationToken,
    ) -> Result<T::O> {
        let mut cx = ExecutionContext {
            client: self.clone(),
            operation,
            session: match session {
                Some(session) => SessionBinding::Explicit(session),
                None => SessionBinding::None,
            },
            owner: Uuid::new_v4(),
            effective_criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
            selector: None,
            server: None,
            in_transaction: false,
        };

        let mut outcome: Option<Result<T::O>> = None;
        for stage in PIPELINE {
            tracing::debug!(
                stage = stage.name(),
                operation = cx.operation.name(),
                "running execution stage"
            );
            match runtime::cancellable(&cancellation, stage.run(&mut cx)).await {
                Ok(Ok(StageFlow::Continue)) => continue,
                Ok(Ok(StageFlow::Finished(result))) => {
                    outcome = Some(Ok(result));
                    break;
                }
                Ok(Err(stage_error)) => {
                    outcome = Some(Err(stage_error));
                    break;
                }
                Err(cancelled) => {
                    outcome = Some(Err(cancelled));
                    break;
                }
            }
        }

        // Cleanup runs no matter where the run stopped: an implicit session
        // owned by this run is ended, and any error from that is swallowed.
        if let SessionBinding::Implicit(mut session) = cx.session {
            if session.is_implicit() && session.owner() == Some(cx.owner) {
                let _ = session.end().await;
            }
        }

        outcome.unwrap_or_else(|| {
            Err(Error::internal(
                "execution pipeline finished without producing an outcome",
            ))
        })
    }
}

async fn connect<T: Operation>(cx: &mut ExecutionContext<'_, T>) -> Result<StageFlow<T::O>> {
    if cx.client.is_connected() {
        return Ok(StageFlow::Continue);
    }
    // Connecting on an operation's behalf must not run the health ping an
    // explicit connect performs; the guard clears the flag on every exit
    // path.
    let result = {
        let _suppress = cx.client.suppress_connect_ping();
        Box::pin(cx.client.connect()).await
    };
    result?;
    Ok(StageFlow::Continue)
}

async fn bind_session<T: Operation>(cx: &mut ExecutionContext<'_, T>) -> Result<StageFlow<T::O>> {
    let topology = cx.client.topology()?;

    // When session support is still undetermined, a server must be contacted
    // before any session decisions can be made.
    if topology.should_check_for_session_support() {
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None });
        topology.select_server(&criteria, None).await?;
    }

    match cx.session {
        SessionBinding::Explicit(ref session) => {
            if session.has_ended() {
                return Err(ErrorKind::Session {
                    message: "cannot use a session that has ended".to_string(),
                }
                .into());
            }
        }
        SessionBinding::None if topology.has_session_support() => {
            let session = cx.client.start_implicit_session(cx.owner).await;
            cx.session = SessionBinding::Implicit(session);
        }
        _ => {}
    }

    if !topology.has_session_support() {
        match cx.session {
            SessionBinding::Explicit(_) => {
                return Err(ErrorKind::Session {
                    message: "attempted to provide a session to an operation, but the current \
                              deployment does not support sessions"
                        .to_string(),
                }
                .into());
            }
            SessionBinding::Implicit(_) => {
                cx.client.warnings().warn_once(
                    "implicit-session-unsupported",
                    "the current deployment does not support sessions; continuing without one",
                );
                if let SessionBinding::Implicit(mut session) =
                    std::mem::replace(&mut cx.session, SessionBinding::None)
                {
                    let _ = session.end().await;
                }
            }
            SessionBinding::None => {}
        }
    }

    let read_pref = cx
        .operation
        .options()
        .read_preference
        .clone()
        .unwrap_or(ReadPreference::Primary);
    cx.in_transaction = cx
        .session
        .as_ref()
        .map(|session| session.in_transaction())
        .unwrap_or(false);
    if cx.in_transaction && read_pref != ReadPreference::Primary {
        return Err(ErrorKind::Transaction {
            message: format!(
                "read preference in a transaction must be primary, got {}",
                read_pref
            ),
        }
        .into());
    }
    cx.effective_criteria = SelectionCriteria::ReadPreference(read_pref);

    // A pin left behind by a committed transaction is released before the
    // next operation, unless the operation opts out of the check.
    if !cx.operation.options().bypass_pinning_check {
        if let Some(session) = cx.session.as_mut() {
            if session.is_pinned()
                && matches!(session.transaction.state, TransactionState::Committed { .. })
            {
                session.unpin(false, false)?;
            }
        }
    }

    Ok(StageFlow::Continue)
}

async fn select_server<T: Operation>(cx: &mut ExecutionContext<'_, T>) -> Result<StageFlow<T::O>> {
    let topology = cx.client.topology()?;

    let selector = if cx.operation.has_aspect(Aspect::MUST_SELECT_SAME_SERVER) {
        // Continuations go through full selection rather than the pinned
        // shortcut so the target's monitor state is re-validated.
        match cx.operation.server_address() {
            Some(address) => SelectionCriteria::from_address(address.clone()),
            None => {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "{} must run on the server that started it, but no server is recorded",
                        cx.operation.name()
                    ),
                }
                .into())
            }
        }
    } else if cx.operation.try_secondary_write() {
        let read_pref = cx
            .effective_criteria
            .as_read_pref()
            .cloned()
            .unwrap_or(ReadPreference::Primary);
        SelectionCriteria::secondary_writable(topology.common_wire_version(), &read_pref)
    } else {
        cx.effective_criteria.clone()
    };

    let server = topology.select_server(&selector, cx.session.as_ref()).await?;
    cx.selector = Some(selector);
    cx.server = Some(server);
    Ok(StageFlow::Continue)
}

async fn invoke<T: Operation>(cx: &mut ExecutionContext<'_, T>) -> Result<StageFlow<T::O>> {
    let Some(server) = cx.server.clone() else {
        return Err(Error::internal("invoke stage reached without a selected server"));
    };

    // Retry eligibility is fixed before the first attempt. The transaction
    // number advances at most once per logical operation, not per attempt.
    let retryability = match cx.session.as_ref() {
        Some(_) => cx.operation.retryability(),
        None => Retryability::None,
    };
    let retry_reads = cx.client.options().retry_reads.unwrap_or(true);
    let retry_writes = cx.client.options().retry_writes.unwrap_or(true);
    let retry_reads_eligible = retry_reads && !cx.in_transaction && cx.operation.can_retry_read();
    let retry_writes_eligible = retry_writes
        && !cx.in_transaction
        && server.supports_retryable_writes()
        && cx.operation.can_retry_write();
    let will_retry = match retryability {
        Retryability::Read => retry_reads_eligible,
        Retryability::Write => retry_writes_eligible,
        Retryability::None => false,
    };
    let is_write = retryability == Retryability::Write;

    if will_retry && is_write {
        cx.operation.options_mut().will_retry_write = true;
        if let Some(session) = cx.session.as_mut() {
            session.increment_txn_number();
            tracing::debug!(
                operation = cx.operation.name(),
                txn_number = session.txn_number(),
                "write is eligible for one retry"
            );
        }
    }

    if let Some(session) = cx.session.as_mut() {
        session.update_last_use();
    }
    server.increment_operation_count();
    let first_attempt = cx.operation.execute(&server, cx.session.as_mut()).await;
    server.decrement_operation_count();

    let original_error = match first_attempt {
        Ok(result) => {
            note_transaction_progress(cx, &server);
            return Ok(StageFlow::Finished(result));
        }
        Err(error) => error,
    };

    if original_error.is_network_error() {
        // The session may have half-used state on the server now; make sure
        // it is not returned to the pool.
        if let Some(session) = cx.session.as_mut() {
            session.mark_dirty();
        }
    }

    // The retry decision table. Anything that falls through re-raises the
    // original failure; at most one re-attempt ever happens.
    if !original_error.is_retry_classifiable() || !will_retry {
        return Err(original_error);
    }
    if is_write && original_error.code() == Some(MMAPV1_RETRY_WRITES_ERROR_CODE) {
        return Err(original_error.rewrite_for_mmapv1());
    }
    if is_write && !original_error.is_write_retryable() {
        return Err(original_error);
    }
    if !is_write && !original_error.is_read_retryable() {
        return Err(original_error);
    }

    if original_error.is_network_error()
        && !cx.in_transaction
        && cx.operation.has_aspect(Aspect::CURSOR_CREATING)
    {
        if let Some(session) = cx.session.as_mut() {
            if session.is_pinned() {
                // The pinned server is now suspect; the retry must not be
                // tied to it or to its pool.
                session.unpin(true, true)?;
            }
        }
    }

    let selector = match cx.selector {
        Some(ref selector) => selector.clone(),
        None => cx.effective_criteria.clone(),
    };
    let topology = cx.client.topology()?;
    let new_server = topology.select_server(&selector, cx.session.as_ref()).await?;
    if is_write && !new_server.supports_retryable_writes() {
        return Err(ErrorKind::InvalidResponse {
            message: "selected server to retry against does not support retryable writes"
                .to_string(),
        }
        .into());
    }

    tracing::debug!(
        operation = cx.operation.name(),
        address = %new_server.address(),
        "retrying operation"
    );
    cx.operation.update_for_retry();

    new_server.increment_operation_count();
    let second_attempt = cx.operation.execute(&new_server, cx.session.as_mut()).await;
    new_server.decrement_operation_count();

    match second_attempt {
        Ok(result) => {
            note_transaction_progress(cx, &new_server);
            Ok(StageFlow::Finished(result))
        }
        // A retry failure that performed no writes is less informative than
        // whatever failed the first attempt.
        Err(retry_error) if retry_error.contains_label(NO_WRITES_PERFORMED) => {
            Err(original_error)
        }
        Err(retry_error) => Err(retry_error),
    }
}

/// The first successful operation of a starting transaction moves it to
/// in-progress and pins the session to the server the transaction is now
/// running on.
fn note_transaction_progress<T: Operation>(
    cx: &mut ExecutionContext<'_, T>,
    server: &SelectedServer,
) {
    if !cx.in_transaction {
        return;
    }
    if let Some(session) = cx.session.as_mut() {
        if session.transaction.state == TransactionState::Starting {
            session.transaction.state = TransactionState::InProgress;
            session.pin_to(server);
        }
    }
}
