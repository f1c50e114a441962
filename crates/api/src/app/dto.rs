use serde::Deserialize;

use courier_core::{CoreError, TicketId};

#[derive(Debug, Deserialize)]
pub struct TicketsConfirmationRequest {
    pub tickets: Vec<String>,
}

impl TicketsConfirmationRequest {
    /// Validate every ticket up front so a bad entry submits nothing.
    pub fn ticket_ids(self) -> Result<Vec<TicketId>, CoreError> {
        self.tickets.into_iter().map(TicketId::new).collect()
    }
}
