use std::{cmp::Ordering, path::Path};

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use tracing::info;

use super::{BatchOp, KvStore};
use crate::errors::{Error, Result};

/// This is the version of the data on this current branch.
/// This version must be bumped, and appropriate migrations written, on any
/// change to the persistent data format.
const LATEST_SCHEMA_VERSION: u32 = 1;

/// Key used to store the `LATEST_SCHEMA_VERSION` value in the metadata column.
const DB_SCHEMA_VERSION_KEY: &[u8; 17] = b"db_schema_version";

// All engine data lives in `DATA_COLUMN`, namespaced by sub-space prefixes.
const DATA_COLUMN: &str = "data";
// This column is just for schema version info. No prefix is used.
const METADATA_COLUMN: &str = "metadata";

/// RocksDB-backed [`KvStore`].
pub struct PersistentStore {
	db: DB,
}

impl PersistentStore {
	/// Opens the database at `db_path`, creating it if missing. An existing
	/// database below the latest schema version is migrated forward; one
	/// ahead of it is refused.
	pub fn open(db_path: &Path) -> Result<Self> {
		Self::open_and_migrate_to_version(db_path, LATEST_SCHEMA_VERSION)
	}

	fn open_and_migrate_to_version(db_path: &Path, version: u32) -> Result<Self> {
		// A bare directory is not a database; RocksDB keeps a CURRENT marker.
		let is_existing_db = db_path.join("CURRENT").exists();

		let cfs = vec![
			ColumnFamilyDescriptor::new(METADATA_COLUMN, Options::default()),
			ColumnFamilyDescriptor::new(DATA_COLUMN, Options::default()),
		];

		let mut create_missing_db_and_cols_opts = Options::default();
		create_missing_db_and_cols_opts.create_missing_column_families(true);
		create_missing_db_and_cols_opts.create_if_missing(true);

		let db = DB::open_cf_descriptors(&create_missing_db_and_cols_opts, db_path, cfs)
			.map_err(|e| Error::Store(format!("failed to open database at {}: {e}", db_path.display())))?;

		if !is_existing_db {
			put_schema_version(&db, version)?;
		}

		migrate_db_to_version(&db, version)?;

		Ok(PersistentStore { db })
	}

	fn data_column(&self) -> &ColumnFamily {
		get_column_handle(&self.db, DATA_COLUMN)
	}
}

impl KvStore for PersistentStore {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.db.get_cf(self.data_column(), key)?)
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		Ok(self.db.put_cf(self.data_column(), key, value)?)
	}

	fn delete(&self, key: &[u8]) -> Result<()> {
		Ok(self.db.delete_cf(self.data_column(), key)?)
	}

	fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let mut items = Vec::new();
		for entry in self.db.iterator_cf(
			self.data_column(),
			rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
		) {
			let (key, value) = entry?;
			if !key.starts_with(prefix) {
				break
			}
			items.push((key.to_vec(), value.to_vec()));
		}
		Ok(items)
	}

	fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
		let mut batch = WriteBatch::default();
		for op in ops {
			match op {
				BatchOp::Put { key, value } => batch.put_cf(self.data_column(), key, value),
				BatchOp::Delete { key } => batch.delete_cf(self.data_column(), key),
			}
		}
		Ok(self.db.write(batch)?)
	}
}

fn get_column_handle<'a>(db: &'a DB, column_name: &str) -> &'a ColumnFamily {
	db.cf_handle(column_name)
		.unwrap_or_else(|| panic!("Should get column family handle for {column_name}"))
}

fn put_schema_version(db: &DB, version: u32) -> Result<()> {
	Ok(db.put_cf(
		get_column_handle(db, METADATA_COLUMN),
		DB_SCHEMA_VERSION_KEY,
		version.to_be_bytes(),
	)?)
}

fn read_schema_version(db: &DB) -> Result<u32> {
	db.get_cf(get_column_handle(db, METADATA_COLUMN), DB_SCHEMA_VERSION_KEY)?
		.map(|version| {
			let version: [u8; 4] =
				version.try_into().expect("schema version should be a big-endian u32");
			u32::from_be_bytes(version)
		})
		.ok_or_else(|| Error::Store("could not find db schema version".to_string()))
}

/// Reads the schema version and migrates the db forward if required.
fn migrate_db_to_version(db: &DB, target_version: u32) -> Result<()> {
	let current_version = read_schema_version(db)?;

	match current_version.cmp(&target_version) {
		Ordering::Equal => Ok(()),
		Ordering::Greater => Err(Error::Store(format!(
			"database schema version {current_version} is ahead of the supported version {target_version}. Is your engine up to date?"
		))),
		Ordering::Less => {
			info!("Database is migrating from version {current_version} to {target_version}");
			// Migration arms are added here alongside schema bumps. Version 1
			// is the first released schema, so nothing older can exist.
			Err(Error::Store(format!(
				"no migration path from schema version {current_version}"
			)))
		},
	}
}
