//! Schema, triggers and per-connection pragmas.
//!
//! The schema is the single source of truth for the capacity policy:
//! three triggers keep a running total of stored bytes in `blob_meta`
//! and delete least-recently-used rows through the `deletable_blob`
//! view whenever a mutation pushes the total over the configured
//! ceiling. Application code never enforces capacity itself.

use rusqlite::Connection;

use crate::error::StorageError;

/// Idempotent schema script.
///
/// `auto_vacuum` must be set before the first table is created so the
/// database file can be shrunk with partial vacuums instead of a full,
/// everything-locking vacuum.
///
/// The `deletable_blob` view yields the minimum prefix of the
/// `(last_used, rowid)` order whose removal brings the stored total back
/// to at-or-below capacity. A row is included only while the running
/// total with that row still present exceeds capacity, and the newest
/// row is never included: at trigger time the newest row is the one the
/// firing statement just wrote, so a blob larger than the entire
/// capacity sweeps out everything else but survives itself.
const SCHEMA_SQL: &str = r#"
pragma auto_vacuum=incremental;

create table if not exists blob (
    name text,
    last_used timestamp default (datetime('now')),
    data blob,
    primary key (name)
);

create table if not exists blob_meta (
    key text primary key,
    value
);

-- Summing length(data) over the whole table on a cold cache is a full
-- scan; the running total keeps startup free of it.
insert or ignore into blob_meta values ('size', 0);

create table if not exists setting (
    name primary key on conflict replace,
    value
);

create view if not exists deletable_blob as
with recursive excess (
    usage_with,
    last_used,
    blob_rowid,
    data_length
) as (
    select *
    from (
        select
            (select value from blob_meta where key='size') as usage_with,
            last_used,
            rowid as blob_rowid,
            length(cast(data as blob)) as data_length
        from blob order by last_used, rowid limit 1
    ) as oldest
    where oldest.usage_with > (select value from setting where name='capacity')
        and exists (
            select 1 from blob b
            where (b.last_used, b.rowid) > (oldest.last_used, oldest.blob_rowid)
        )
    union all
    select
        excess.usage_with - excess.data_length,
        nxt.last_used,
        nxt.rowid,
        length(cast(nxt.data as blob))
    from excess join blob as nxt on nxt.rowid = (
        select b.rowid from blob b
        where (b.last_used, b.rowid) > (excess.last_used, excess.blob_rowid)
        order by b.last_used, b.rowid
        limit 1
    )
    where excess.usage_with - excess.data_length
            > (select value from setting where name='capacity')
        and exists (
            select 1 from blob b
            where (b.last_used, b.rowid) > (nxt.last_used, nxt.rowid)
        )
)
select * from excess;

create trigger if not exists after_insert_blob
after insert on blob
begin
    update blob_meta set value=value+length(cast(new.data as blob)) where key='size';
    delete from blob where rowid in (select blob_rowid from deletable_blob);
end;

create trigger if not exists after_update_blob
after update of data on blob
begin
    update blob_meta
        set value=value+length(cast(new.data as blob))-length(cast(old.data as blob))
        where key='size';
    delete from blob where rowid in (select blob_rowid from deletable_blob);
end;

create trigger if not exists after_delete_blob
after delete on blob
begin
    update blob_meta set value=value-length(cast(old.data as blob)) where key='size';
end;
"#;

/// Initialize the schema on the given connection.
///
/// Safe to run repeatedly; every statement is `if not exists`.
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)
}

/// Apply the per-connection pragmas, in order.
///
/// Recursive triggers are required because the capacity sweep inside the
/// insert/update triggers must itself fire the delete trigger that
/// maintains the size total. `synchronous=off` trades durability for
/// throughput. Without WAL, journaling is disabled outright. The mmap
/// request is deliberately enormous; SQLite clamps it to what the OS
/// grants.
pub fn apply_conn_pragmas(conn: &Connection, wal: bool) -> Result<(), rusqlite::Error> {
    exec_pragma(conn, "pragma recursive_triggers=on")?;
    exec_pragma(conn, "pragma synchronous=off")?;
    if wal {
        exec_pragma(conn, "pragma journal_mode=wal")?;
    } else {
        exec_pragma(conn, "pragma journal_mode=off")?;
    }
    exec_pragma(conn, "pragma mmap_size=1000000000000")?;
    Ok(())
}

/// Run a pragma, discarding any rows it reports back.
///
/// `journal_mode` and `mmap_size` answer with their new value; stepping
/// through the rows keeps this working for every pragma.
fn exec_pragma(conn: &Connection, sql: &str) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

/// Set the capacity ceiling to exactly this many bytes.
///
/// The `setting` table replaces on conflict, so this supersedes any
/// previous value. Enforcement happens on the next mutating write; the
/// triggers consult the setting dynamically.
pub fn set_capacity(conn: &Connection, capacity: i64) -> Result<(), StorageError> {
    conn.execute(
        "insert into setting values ('capacity', ?1)",
        [capacity],
    )?;
    Ok(())
}

/// Remove the capacity ceiling.
///
/// No eviction happens until a capacity is set again.
pub fn unlimit_capacity(conn: &Connection) -> Result<(), StorageError> {
    conn.execute("delete from setting where name='capacity'", [])?;
    Ok(())
}
