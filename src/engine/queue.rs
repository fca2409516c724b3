use crate::engine::location::PositionSample;
use crate::error::AppError;
use crate::state::AppState;

pub async fn enqueue_position(state: &AppState, sample: PositionSample) -> Result<(), AppError> {
    state
        .location_tx
        .send(sample)
        .await
        .map_err(|err| AppError::Internal(format!("position queue send failed: {err}")))?;

    state.metrics.positions_in_queue.inc();
    Ok(())
}
