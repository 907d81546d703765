use std::sync::Arc;
use uuid::Uuid;

use super::{Invoice, InvoiceStatus};
use crate::error::{BillingError, BillingResult};
use crate::store::{CasOutcome, InvoiceStore};

/// Guards the DRAFT -> FINALIZED transition
pub struct InvoiceFinalizer {
    invoices: Arc<dyn InvoiceStore>,
}

impl InvoiceFinalizer {
    pub fn new(invoices: Arc<dyn InvoiceStore>) -> Self {
        Self { invoices }
    }

    /// Lock a draft invoice for payment.
    ///
    /// Fails with `InvoiceAlreadyFinalized` when it already is, and with
    /// `InvoiceNotDraft` for any other non-draft state, including losing a race
    /// against a concurrent finalizer.
    pub async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut invoice = self
            .invoices
            .get_invoice_by_id(invoice_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;

        match invoice.status {
            InvoiceStatus::Draft => {}
            InvoiceStatus::Finalized => return Err(BillingError::InvoiceAlreadyFinalized),
            status => return Err(BillingError::InvoiceNotDraft { status }),
        }

        check_integrity(&invoice)?;

        match self.invoices.finalize_invoice(invoice_id).await? {
            CasOutcome::Applied => {
                invoice.status = InvoiceStatus::Finalized;
                tracing::info!(
                    invoice_id = %invoice_id,
                    tenant_id = %invoice.tenant_id,
                    total_cents = invoice.total_cents,
                    "Invoice finalized"
                );
                Ok(invoice)
            }
            CasOutcome::Unchanged => {
                let status = self
                    .invoices
                    .get_invoice_by_id(invoice_id)
                    .await?
                    .map_or(InvoiceStatus::Void, |i| i.status);
                tracing::warn!(invoice_id = %invoice_id, %status, "Invoice changed state during finalize");
                Err(BillingError::InvoiceNotDraft { status })
            }
        }
    }
}

/// Applies to zero-total invoices too
fn check_integrity(invoice: &Invoice) -> BillingResult<()> {
    if invoice.total_cents < 0 {
        return Err(BillingError::Integrity(format!(
            "invoice {} has negative total {}",
            invoice.id, invoice.total_cents
        )));
    }
    if invoice.currency.trim().is_empty() {
        return Err(BillingError::Integrity(format!(
            "invoice {} has no currency",
            invoice.id
        )));
    }
    let lines_total: i64 = invoice.lines.iter().map(|l| l.line_total_cents).sum();
    if lines_total != invoice.total_cents {
        return Err(BillingError::Integrity(format!(
            "invoice {} lines sum to {lines_total}, total is {}",
            invoice.id, invoice.total_cents
        )));
    }
    Ok(())
}
