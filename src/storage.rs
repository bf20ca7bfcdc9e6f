//! Persistent node identity.
//!
//! The provisioned [`NodeConfig`] (node id + application key) is kept in
//! the nRF52840's internal flash through `sequential-storage`, which
//! handles wear levelling and garbage collection across the reserved
//! pages.
//!
//! Storage layout:
//!   - One key-value map over pages `STORAGE_FLASH_PAGE_START..+COUNT`
//!   - `KEY_NODE_CONFIG` holds the serialized config (id LE, then key)

use blesc::config::{NodeConfig, STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
use blesc::StorageError;
use defmt::{error, info};
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map;

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

/// Start address of our storage region.
const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;

/// End address (exclusive) of our storage region.
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

const KEY_NODE_CONFIG: u8 = 0x01;

/// Scratch buffer for `sequential-storage` (item plus its header).
const BUF_LEN: usize = 64;

pub struct ConfigStore<F> {
    flash: F,
}

impl<F: NorFlash> ConfigStore<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    /// `Ok(None)` means the node was never provisioned (or was unconfigured).
    pub async fn load(&mut self) -> Result<Option<NodeConfig>, StorageError> {
        let mut buf = [0u8; BUF_LEN];
        let item = map::fetch_item::<u8, &[u8], _>(
            &mut self.flash,
            STORAGE_START..STORAGE_END,
            &mut NoCache::new(),
            &mut buf,
            &KEY_NODE_CONFIG,
        )
        .await
        .map_err(|e| {
            error!("Flash read error: {:?}", defmt::Debug2Format(&e));
            StorageError::Flash
        })?;

        match item {
            Some(data) => {
                let cfg = NodeConfig::deserialize(data)?;
                info!("Node id {} loaded", cfg.node_id);
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }

    pub async fn save(&mut self, cfg: &NodeConfig) -> Result<(), StorageError> {
        let mut data = [0u8; NodeConfig::SERIALIZED_LEN];
        let len = cfg.serialize(&mut data)?;
        let item: &[u8] = &data[..len];

        let mut buf = [0u8; BUF_LEN];
        map::store_item::<u8, &[u8], _>(
            &mut self.flash,
            STORAGE_START..STORAGE_END,
            &mut NoCache::new(),
            &mut buf,
            &KEY_NODE_CONFIG,
            &item,
        )
        .await
        .map_err(|e| {
            error!("Flash write error: {:?}", defmt::Debug2Format(&e));
            StorageError::Flash
        })?;
        info!("Node id {} saved", cfg.node_id);
        Ok(())
    }

    /// Forget the provisioned identity.
    pub async fn erase(&mut self) -> Result<(), StorageError> {
        let mut buf = [0u8; BUF_LEN];
        map::remove_item::<u8, _>(
            &mut self.flash,
            STORAGE_START..STORAGE_END,
            &mut NoCache::new(),
            &mut buf,
            &KEY_NODE_CONFIG,
        )
        .await
        .map_err(|e| {
            error!("Flash erase error: {:?}", defmt::Debug2Format(&e));
            StorageError::Flash
        })?;
        info!("Node config erased");
        Ok(())
    }
}
