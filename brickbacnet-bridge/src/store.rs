//! Metadata store backed by SQLite.
//!
//! Holds discovered devices and their points, keyed by device id and a
//! dataset version label, plus a UUID index for resolving points by UUID.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::address;
use crate::error::{Error, Result};
use crate::model::{DataPoint, Device, DeviceRecord};
use crate::object::ObjectType;
use crate::transport::Segmentation;

/// Default dataset version label.
pub const DEFAULT_VERSION: &str = "v1";

/// Locates one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKey {
    Instance { device_id: u32, instance: u32 },
    Uuid(Uuid),
}

/// Record addressed by [`MetadataStore::update_field`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    Device(u32),
    Object { device_id: u32, instance: u32 },
}

/// Scalar device columns that may be edited.
const DEVICE_TEXT_FIELDS: &[&str] = &["address", "name", "description", "vendor_name", "segmentation"];
const DEVICE_INTEGER_FIELDS: &[&str] = &["vendor_id", "max_apdu", "object_count"];
/// Scalar object columns that may be edited; other names must be custom fields.
const OBJECT_TEXT_FIELDS: &[&str] = &["object_type", "description", "vendor_name", "sensor_type", "unit"];

const DEVICE_COLUMNS: &str = "device_id, address, name, description, vendor_id, max_apdu, \
                              segmentation, object_count, vendor_name, uuid";
const OBJECT_COLUMNS: &str = "device_id, instance, object_type, description, vendor_name, \
                              sensor_type, unit, custom_fields, uuid";

/// SQLite-backed metadata store bound to one dataset version.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    version: String,
}

impl MetadataStore {
    /// Open or create a store at `path`.
    pub async fn open(path: impl AsRef<Path>, version: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            version: version.into(),
        };
        store.init_schema().await?;

        info!("Metadata store opened at {} (version {})", path.display(), store.version);
        Ok(store)
    }

    /// Create a private in-memory store.
    ///
    /// The pool keeps exactly one connection alive for its whole lifetime so
    /// the database is never dropped.
    pub async fn in_memory(version: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            version: version.into(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Dataset version this store reads and writes.
    pub fn version(&self) -> &str {
        &self.version
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                address TEXT NOT NULL,
                name TEXT,
                description TEXT,
                vendor_id INTEGER NOT NULL,
                max_apdu INTEGER NOT NULL,
                segmentation TEXT NOT NULL,
                object_count INTEGER,
                vendor_name TEXT,
                uuid TEXT UNIQUE,
                PRIMARY KEY (device_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                device_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                instance INTEGER NOT NULL,
                object_type TEXT NOT NULL,
                description TEXT,
                vendor_name TEXT,
                sensor_type TEXT,
                unit TEXT,
                custom_fields TEXT NOT NULL DEFAULT '{}',
                uuid TEXT UNIQUE,
                PRIMARY KEY (device_id, version, instance),
                FOREIGN KEY (device_id, version) REFERENCES devices(device_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS uuid_index (
                uuid TEXT PRIMARY KEY,
                device_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                instance INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_uuid_index_point ON uuid_index(device_id, version, instance)")
            .execute(&self.pool)
            .await?;

        debug!("Metadata store schema initialized");
        Ok(())
    }

    /// Create or replace a device record.
    ///
    /// Every stored point of the device and their UUID index entries are
    /// removed in the same transaction. An existing device UUID is kept.
    pub async fn upsert_device(&self, device: &Device) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM uuid_index WHERE device_id = ? AND version = ?")
            .bind(device.device_id)
            .bind(&self.version)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM objects WHERE device_id = ? AND version = ?")
            .bind(device.device_id)
            .bind(&self.version)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, version, address, name, description, vendor_id,
                                 max_apdu, segmentation, object_count, vendor_name, uuid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id, version) DO UPDATE SET
                address = excluded.address,
                name = excluded.name,
                description = excluded.description,
                vendor_id = excluded.vendor_id,
                max_apdu = excluded.max_apdu,
                segmentation = excluded.segmentation,
                object_count = excluded.object_count,
                vendor_name = excluded.vendor_name,
                uuid = COALESCE(devices.uuid, excluded.uuid)
            "#,
        )
        .bind(device.device_id)
        .bind(&self.version)
        .bind(&device.address)
        .bind(&device.name)
        .bind(&device.description)
        .bind(device.vendor_id)
        .bind(device.max_apdu)
        .bind(device.segmentation.as_str())
        .bind(device.object_count)
        .bind(&device.vendor_name)
        .bind(device.uuid.map(|u| u.to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(device_id = device.device_id, version = %self.version, "Device upserted");
        Ok(())
    }

    /// Read a device and the instances of its stored points, in ascending order.
    pub async fn read_device(&self, device_id: u32) -> Result<DeviceRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM devices WHERE device_id = ? AND version = ?",
            DEVICE_COLUMNS
        ))
        .bind(device_id)
        .bind(&self.version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("device {} ({})", device_id, self.version)))?;

        let device = device_from_row(&row)?;

        let instances: Vec<i64> = sqlx::query_scalar(
            "SELECT instance FROM objects WHERE device_id = ? AND version = ? ORDER BY instance",
        )
        .bind(device_id)
        .bind(&self.version)
        .fetch_all(&self.pool)
        .await?;

        Ok(DeviceRecord {
            device,
            version: self.version.clone(),
            instances: instances
                .into_iter()
                .map(|i| to_u32("instance", i))
                .collect::<Result<_>>()?,
        })
    }

    /// Every device of this version, by device id.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM devices WHERE version = ? ORDER BY device_id",
            DEVICE_COLUMNS
        ))
        .bind(&self.version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(device_from_row).collect()
    }

    /// Create or replace one point.
    ///
    /// Fails with [`Error::Store`] if the owning device row does not exist.
    pub async fn upsert_object(&self, point: &DataPoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let device: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM devices WHERE device_id = ? AND version = ?")
                .bind(point.device_id)
                .bind(&self.version)
                .fetch_optional(&mut *tx)
                .await?;
        if device.is_none() {
            return Err(Error::Store(format!(
                "relation does not exist: device {} ({})",
                point.device_id, self.version
            )));
        }

        sqlx::query("DELETE FROM uuid_index WHERE device_id = ? AND version = ? AND instance = ?")
            .bind(point.device_id)
            .bind(&self.version)
            .bind(point.instance)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM objects WHERE device_id = ? AND version = ? AND instance = ?")
            .bind(point.device_id)
            .bind(&self.version)
            .bind(point.instance)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO objects (device_id, version, instance, object_type, description,
                                 vendor_name, sensor_type, unit, custom_fields, uuid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(point.device_id)
        .bind(&self.version)
        .bind(point.instance)
        .bind(point.object_type.to_string())
        .bind(&point.description)
        .bind(&point.vendor_name)
        .bind(&point.sensor_type)
        .bind(&point.unit)
        .bind(serde_json::to_string(&point.custom_fields)?)
        .bind(point.uuid.map(|u| u.to_string()))
        .execute(&mut *tx)
        .await?;

        if let Some(uuid) = point.uuid {
            insert_index(&mut tx, uuid, point.device_id, &self.version, point.instance).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Read one point by device and instance, or by UUID.
    pub async fn read_object(&self, key: ObjectKey) -> Result<DataPoint> {
        let (device_id, instance) = match key {
            ObjectKey::Instance {
                device_id,
                instance,
            } => (device_id, instance),
            ObjectKey::Uuid(uuid) => {
                let row = sqlx::query(
                    "SELECT device_id, instance FROM uuid_index WHERE uuid = ? AND version = ?",
                )
                .bind(uuid.to_string())
                .bind(&self.version)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::NotFound(format!("uuid {}", uuid)))?;
                (get_u32(&row, "device_id")?, get_u32(&row, "instance")?)
            }
        };

        let row = sqlx::query(&format!(
            "SELECT {} FROM objects WHERE device_id = ? AND version = ? AND instance = ?",
            OBJECT_COLUMNS
        ))
        .bind(device_id)
        .bind(&self.version)
        .bind(instance)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("object {} of device {}", instance, device_id)))?;

        point_from_row(&row)
    }

    /// Every stored point of a device, by instance.
    pub async fn read_objects(&self, device_id: u32) -> Result<Vec<DataPoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM objects WHERE device_id = ? AND version = ? ORDER BY instance",
            OBJECT_COLUMNS
        ))
        .bind(device_id)
        .bind(&self.version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(point_from_row).collect()
    }

    /// Set one field of a device or point.
    ///
    /// Field names are checked against the known columns; any other object
    /// field must already exist among the point's custom fields. A UUID can
    /// only be assigned once and must be unused.
    pub async fn update_field(&self, target: FieldTarget, field: &str, value: Option<&str>) -> Result<()> {
        if field == "uuid" {
            return self.assign_uuid(target, value).await;
        }

        match target {
            FieldTarget::Device(device_id) => self.update_device_field(device_id, field, value).await,
            FieldTarget::Object {
                device_id,
                instance,
            } => self.update_object_field(device_id, instance, field, value).await,
        }
    }

    async fn update_device_field(&self, device_id: u32, field: &str, value: Option<&str>) -> Result<()> {
        let column = DEVICE_TEXT_FIELDS
            .iter()
            .chain(DEVICE_INTEGER_FIELDS)
            .find(|c| **c == field)
            .ok_or_else(|| Error::Store(format!("unknown device field '{}'", field)))?;

        let sql = format!(
            "UPDATE devices SET {} = ? WHERE device_id = ? AND version = ?",
            column
        );
        let query = if DEVICE_INTEGER_FIELDS.contains(column) {
            let number = value
                .map(|v| v.trim().parse::<u32>().map_err(|_| Error::type_mismatch("integer", v)))
                .transpose()?;
            sqlx::query(&sql).bind(number)
        } else {
            match (*column, value) {
                ("address" | "segmentation", None) => {
                    return Err(Error::Store(format!("device field '{}' cannot be null", field)));
                }
                ("address", Some(v)) => {
                    address::decode(v)?;
                }
                ("segmentation", Some(v)) if Segmentation::parse(v).is_none() => {
                    return Err(Error::type_mismatch("segmentation", v));
                }
                _ => {}
            }
            sqlx::query(&sql).bind(value)
        };

        let result = query
            .bind(device_id)
            .bind(&self.version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("device {} ({})", device_id, self.version)));
        }
        Ok(())
    }

    async fn update_object_field(
        &self,
        device_id: u32,
        instance: u32,
        field: &str,
        value: Option<&str>,
    ) -> Result<()> {
        if let Some(column) = OBJECT_TEXT_FIELDS.iter().find(|c| **c == field) {
            if *column == "object_type" {
                let text = value.ok_or_else(|| Error::type_mismatch("object type", "null"))?;
                ObjectType::from_str(text)?;
            }

            let result = sqlx::query(&format!(
                "UPDATE objects SET {} = ? WHERE device_id = ? AND version = ? AND instance = ?",
                column
            ))
            .bind(value)
            .bind(device_id)
            .bind(&self.version)
            .bind(instance)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("object {} of device {}", instance, device_id)));
            }
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let custom: String = sqlx::query_scalar(
            "SELECT custom_fields FROM objects WHERE device_id = ? AND version = ? AND instance = ?",
        )
        .bind(device_id)
        .bind(&self.version)
        .bind(instance)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("object {} of device {}", instance, device_id)))?;

        let mut fields: BTreeMap<String, serde_json::Value> = serde_json::from_str(&custom)?;
        let slot = fields
            .get_mut(field)
            .ok_or_else(|| Error::Store(format!("unknown object field '{}'", field)))?;
        *slot = value.map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.to_string()));

        sqlx::query(
            "UPDATE objects SET custom_fields = ? WHERE device_id = ? AND version = ? AND instance = ?",
        )
        .bind(serde_json::to_string(&fields)?)
        .bind(device_id)
        .bind(&self.version)
        .bind(instance)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn assign_uuid(&self, target: FieldTarget, value: Option<&str>) -> Result<()> {
        let text = value.ok_or_else(|| Error::Store("uuid cannot be cleared".to_string()))?;
        let uuid = Uuid::parse_str(text.trim()).map_err(|_| Error::type_mismatch("uuid", text))?;
        let uuid_text = uuid.to_string();

        let mut tx = self.pool.begin().await?;

        let in_use: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM devices WHERE uuid = ?) + (SELECT COUNT(*) FROM uuid_index WHERE uuid = ?)",
        )
        .bind(&uuid_text)
        .bind(&uuid_text)
        .fetch_one(&mut *tx)
        .await?;
        if in_use > 0 {
            return Err(Error::Store(format!("uuid {} is already assigned", uuid)));
        }

        match target {
            FieldTarget::Device(device_id) => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT uuid FROM devices WHERE device_id = ? AND version = ?")
                        .bind(device_id)
                        .bind(&self.version)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("device {} ({})", device_id, self.version)))?;
                if let Some(current) = current {
                    return Err(Error::Store(format!("device {} already has uuid {}", device_id, current)));
                }

                sqlx::query("UPDATE devices SET uuid = ? WHERE device_id = ? AND version = ?")
                    .bind(&uuid_text)
                    .bind(device_id)
                    .bind(&self.version)
                    .execute(&mut *tx)
                    .await?;
            }
            FieldTarget::Object {
                device_id,
                instance,
            } => {
                let current: Option<String> = sqlx::query_scalar(
                    "SELECT uuid FROM objects WHERE device_id = ? AND version = ? AND instance = ?",
                )
                .bind(device_id)
                .bind(&self.version)
                .bind(instance)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| Error::NotFound(format!("object {} of device {}", instance, device_id)))?;
                if let Some(current) = current {
                    return Err(Error::Store(format!(
                        "object {} of device {} already has uuid {}",
                        instance, device_id, current
                    )));
                }

                sqlx::query("UPDATE objects SET uuid = ? WHERE device_id = ? AND version = ? AND instance = ?")
                    .bind(&uuid_text)
                    .bind(device_id)
                    .bind(&self.version)
                    .bind(instance)
                    .execute(&mut *tx)
                    .await?;
                insert_index(&mut tx, uuid, device_id, &self.version, instance).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// UUID of a point; [`Error::NotFound`] if the point is missing or unassigned.
    pub async fn find_uuid(&self, device_id: u32, instance: u32) -> Result<Uuid> {
        let uuid: Option<String> = sqlx::query_scalar(
            "SELECT uuid FROM objects WHERE device_id = ? AND version = ? AND instance = ?",
        )
        .bind(device_id)
        .bind(&self.version)
        .bind(instance)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        parse_stored_uuid(uuid)?
            .ok_or_else(|| Error::NotFound(format!("uuid of object {} of device {}", instance, device_id)))
    }

    /// UUID of a device; [`Error::NotFound`] if the device is missing or unassigned.
    pub async fn find_device_uuid(&self, device_id: u32) -> Result<Uuid> {
        let uuid: Option<String> =
            sqlx::query_scalar("SELECT uuid FROM devices WHERE device_id = ? AND version = ?")
                .bind(device_id)
                .bind(&self.version)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        parse_stored_uuid(uuid)?.ok_or_else(|| Error::NotFound(format!("uuid of device {}", device_id)))
    }

    /// Give a fresh random UUID to the device and every point of it that has none.
    ///
    /// Returns the number of UUIDs assigned.
    pub async fn assign_missing_uuids(&self, device_id: u32) -> Result<usize> {
        let record = self.read_device(device_id).await?;
        let mut assigned = 0;

        if record.device.uuid.is_none() {
            let uuid = Uuid::new_v4().to_string();
            self.update_field(FieldTarget::Device(device_id), "uuid", Some(&uuid))
                .await?;
            assigned += 1;
        }

        for point in self.read_objects(device_id).await? {
            if point.uuid.is_some() {
                continue;
            }
            let uuid = Uuid::new_v4().to_string();
            let target = FieldTarget::Object {
                device_id,
                instance: point.instance,
            };
            self.update_field(target, "uuid", Some(&uuid)).await?;
            assigned += 1;
        }

        info!(device_id, assigned, "Assigned UUIDs");
        Ok(assigned)
    }
}

async fn insert_index(
    conn: &mut SqliteConnection,
    uuid: Uuid,
    device_id: u32,
    version: &str,
    instance: u32,
) -> Result<()> {
    sqlx::query("INSERT INTO uuid_index (uuid, device_id, version, instance) VALUES (?, ?, ?, ?)")
        .bind(uuid.to_string())
        .bind(device_id)
        .bind(version)
        .bind(instance)
        .execute(conn)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                Error::Store(format!("uuid {} is already assigned", uuid))
            } else {
                e.into()
            }
        })?;
    Ok(())
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let segmentation: String = row.try_get("segmentation")?;
    let vendor_id = get_u32(row, "vendor_id")?;

    Ok(Device {
        device_id: get_u32(row, "device_id")?,
        address: row.try_get("address")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        vendor_id: u16::try_from(vendor_id)
            .map_err(|_| Error::Store(format!("vendor_id out of range: {}", vendor_id)))?,
        max_apdu: get_u32(row, "max_apdu")?,
        segmentation: Segmentation::parse(&segmentation)
            .ok_or_else(|| Error::Store(format!("unknown segmentation '{}'", segmentation)))?,
        object_count: row
            .try_get::<Option<i64>, _>("object_count")?
            .map(|n| to_u32("object_count", n))
            .transpose()?,
        vendor_name: row.try_get("vendor_name")?,
        uuid: parse_stored_uuid(row.try_get("uuid")?)?,
    })
}

fn point_from_row(row: &SqliteRow) -> Result<DataPoint> {
    let object_type: String = row.try_get("object_type")?;
    let custom_fields: String = row.try_get("custom_fields")?;

    Ok(DataPoint {
        device_id: get_u32(row, "device_id")?,
        instance: get_u32(row, "instance")?,
        object_type: object_type
            .parse()
            .map_err(|_| Error::Store(format!("unknown object type '{}'", object_type)))?,
        description: row.try_get("description")?,
        vendor_name: row.try_get("vendor_name")?,
        sensor_type: row.try_get("sensor_type")?,
        unit: row.try_get("unit")?,
        custom_fields: serde_json::from_str(&custom_fields)?,
        uuid: parse_stored_uuid(row.try_get("uuid")?)?,
    })
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32> {
    to_u32(column, row.try_get::<i64, _>(column)?)
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Store(format!("{} out of range: {}", column, value)))
}

fn parse_stored_uuid(value: Option<String>) -> Result<Option<Uuid>> {
    value
        .map(|s| Uuid::parse_str(&s).map_err(|_| Error::Store(format!("corrupt uuid '{}'", s))))
        .transpose()
}
