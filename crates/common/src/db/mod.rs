//! Database layer for Intake
//!
//! Provides:
//! - SeaORM entity models
//! - Repository implementing the extraction store contracts
//! - Connection pool management
//! - Schema bootstrap from entities

pub mod models;
mod repository;

pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use models::{DocumentEntity, ExtractionCacheEntity, ExtractionTaskColumn, ExtractionTaskEntity};
use sea_orm::sea_query::Index;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection (for writes)
    pub primary: DatabaseConnection,
    
    /// Read replica connection (optional)
    pub replica: Option<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to primary database...");
        
        let mut primary_opts = ConnectOptions::new(&config.url);
        primary_opts
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(true);
        
        let primary = Database::connect(primary_opts)
            .await
            .map_err(|e| AppError::DatabaseConnection { 
                message: format!("Failed to connect to primary: {}", e) 
            })?;
        
        // Connect to replica if configured
        let replica = if let Some(ref read_url) = config.read_url {
            info!("Connecting to read replica...");
            
            let mut replica_opts = ConnectOptions::new(read_url);
            replica_opts
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
                .sqlx_logging(true);
            
            let replica_conn = Database::connect(replica_opts)
                .await
                .map_err(|e| AppError::DatabaseConnection { 
                    message: format!("Failed to connect to replica: {}", e) 
                })?;
            
            Some(replica_conn)
        } else {
            None
        };
        
        info!("Database connections established");
        
        Ok(Self { primary, replica })
    }
    
    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_ref().unwrap_or(&self.primary)
    }
    
    /// Get the connection for writes (always primary)
    pub fn write(&self) -> &DatabaseConnection {
        &self.primary
    }
    
    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;
        
        if let Some(ref replica) = self.replica {
            replica
                .execute_unprepared("SELECT 1")
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Replica ping failed: {}", e),
                })?;
        }
        
        Ok(())
    }

    /// Close all connections
    pub async fn close(self) {
        if let Err(e) = self.primary.close().await {
            tracing::warn!(error = %e, "Failed to close primary connection");
        }
        if let Some(replica) = self.replica {
            if let Err(e) = replica.close().await {
                tracing::warn!(error = %e, "Failed to close replica connection");
            }
        }
    }

    /// Create missing tables and indexes from the entity definitions
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.write();
        let backend = conn.get_database_backend();
        let schema = Schema::new(backend);

        let tables = [
            schema
                .create_table_from_entity(ExtractionTaskEntity)
                .if_not_exists()
                .to_owned(),
            schema
                .create_table_from_entity(ExtractionCacheEntity)
                .if_not_exists()
                .to_owned(),
            // Owned by the proposal domain; created only for standalone deployments
            schema
                .create_table_from_entity(DocumentEntity)
                .if_not_exists()
                .to_owned(),
        ];
        for table in &tables {
            conn.execute(backend.build(table)).await?;
        }

        // Stuck sweep filters on status and orders by staleness
        let index = Index::create()
            .if_not_exists()
            .name("idx_extraction_tasks_status_updated_at")
            .table(ExtractionTaskEntity)
            .col(ExtractionTaskColumn::Status)
            .col(ExtractionTaskColumn::UpdatedAt)
            .to_owned();
        conn.execute(backend.build(&index)).await?;

        info!("Database schema ensured");
        Ok(())
    }
}
