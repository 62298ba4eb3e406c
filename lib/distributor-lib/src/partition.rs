use crate::{
    batch::Batch,
    recipient::{Recipient, ValidationError},
};

/// Split recipients into contiguous, order-preserving batches of at most
/// `batch_size` recipients. Only the last batch may be smaller.
pub fn partition(
    recipients: Vec<Recipient>,
    batch_size: usize,
    max_recipients: usize,
) -> Result<Vec<Batch>, ValidationError> {
    if batch_size == 0 {
        return Err(ValidationError::ZeroBatchSize);
    }
    if recipients.is_empty() {
        return Err(ValidationError::Empty);
    }
    if recipients.len() > max_recipients {
        return Err(ValidationError::TooMany {
            count: recipients.len(),
            max: max_recipients,
        });
    }

    let mut batches = Vec::with_capacity(recipients.len().div_ceil(batch_size));
    let mut iter = recipients.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk = iter.by_ref().take(batch_size).collect();
        batches.push(Batch::new(batches.len(), chunk));
    }
    Ok(batches)
}
