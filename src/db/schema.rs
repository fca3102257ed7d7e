use rusqlite::Connection;

/// Initialize the main database schema (everything except audit logs)
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Donors (identity - source of truth for email/name)
        CREATE TABLE IF NOT EXISTS donors (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_donors_email ON donors(email);

        -- Gifts (one-time donation transactions)
        -- Soft delete only: deleted_at = timestamp when deleted, NULL = active.
        -- Rows are retained for audit; status transitions are owned by the
        -- donation state machine.
        CREATE TABLE IF NOT EXISTS gifts (
            id TEXT PRIMARY KEY,
            donor_id TEXT NOT NULL REFERENCES donors(id),
            campaign_id TEXT,
            plan_id TEXT REFERENCES recurring_plans(id),
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL CHECK (currency IN ('usd', 'cad', 'eur')),
            donor_covers_fee INTEGER NOT NULL DEFAULT 0,
            fee_amount_cents INTEGER,
            processor_fee_cents INTEGER,
            net_amount_cents INTEGER,
            status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed', 'refunded')),
            processor TEXT NOT NULL CHECK (processor IN ('stripe', 'paypal')),
            processor_ref TEXT,
            completed_at INTEGER,
            refunded_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_gifts_donor ON gifts(donor_id);
        CREATE INDEX IF NOT EXISTS idx_gifts_status ON gifts(status);
        CREATE INDEX IF NOT EXISTS idx_gifts_processor_ref ON gifts(processor, processor_ref);
        CREATE INDEX IF NOT EXISTS idx_gifts_active ON gifts(id) WHERE deleted_at IS NULL;

        -- Recurring plans (standing mandates)
        -- mandate_id is established at the processor before the row exists.
        CREATE TABLE IF NOT EXISTS recurring_plans (
            id TEXT PRIMARY KEY,
            donor_id TEXT NOT NULL REFERENCES donors(id),
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL CHECK (currency IN ('usd', 'cad', 'eur')),
            frequency TEXT NOT NULL CHECK (frequency IN ('monthly', 'quarterly', 'annually')),
            donor_covers_fee INTEGER NOT NULL DEFAULT 0,
            fee_amount_cents INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('active', 'paused', 'cancelled')),
            processor TEXT NOT NULL CHECK (processor IN ('stripe', 'paypal')),
            mandate_id TEXT NOT NULL,
            next_charge_date INTEGER NOT NULL,
            last_charged_at INTEGER,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            paused_at INTEGER,
            cancelled_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(processor, mandate_id)
        );
        CREATE INDEX IF NOT EXISTS idx_plans_donor ON recurring_plans(donor_id);
        CREATE INDEX IF NOT EXISTS idx_plans_status ON recurring_plans(status);

        -- Receipts (one per settled gift, created in the success transaction)
        CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            gift_id TEXT NOT NULL UNIQUE REFERENCES gifts(id),
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            tax_year INTEGER NOT NULL,
            issued_at INTEGER NOT NULL
        );

        -- Webhook events (idempotency ledger)
        -- Inserting a row is the atomic claim; the UNIQUE constraint is the
        -- sole serialization point for concurrent redelivery.
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            processor TEXT NOT NULL,
            external_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(processor, external_id)
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_events_lookup ON webhook_events(processor, external_id);
        "#,
    )?;
    Ok(())
}

/// Initialize the audit log database schema (separate DB file)
/// Optimized for append-only workload with WAL mode
pub fn init_audit_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA journal_size_limit = 67108864;

        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            actor_type TEXT NOT NULL,
            actor_id TEXT,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            details TEXT,
            ip_address TEXT,
            user_agent TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_logs(resource_type, resource_id);
        CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action);
        "#,
    )?;
    Ok(())
}
