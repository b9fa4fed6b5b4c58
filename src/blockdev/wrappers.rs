//! Decorator wrappers around [`BlockDevice`]
//!
//! Each wrapper forwards geometry, `flush`, and `close` to the device it
//! wraps and applies its transform only around `read_block`/`write_block`.

use std::sync::Arc;

use super::{check_io, BlockDevice, BlockDeviceError, DeviceKind, Result};

/// Rejects every write while forwarding reads unchanged.
pub struct ReadOnlyDevice {
    inner: Arc<dyn BlockDevice>,
}

impl ReadOnlyDevice {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self { inner }
    }
}

impl BlockDevice for ReadOnlyDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_block(block, buf)
    }

    fn write_block(&self, _block: u64, _data: &[u8]) -> Result<()> {
        Err(BlockDeviceError::ReadOnly)
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::ReadOnly
    }
}

/// XOR-cipher device keyed by a caller-supplied key.
///
/// The same transform encrypts and decrypts; stored bytes are the
/// plaintext XOR-ed with the key repeated over the block.
pub struct XorEncryptedDevice {
    inner: Arc<dyn BlockDevice>,
    key: Vec<u8>,
}

impl XorEncryptedDevice {
    pub fn new(inner: Arc<dyn BlockDevice>, key: Vec<u8>) -> Result<Self> {
        if key.is_empty() {
            return Err(BlockDeviceError::InvalidGeometry(
                "encryption key must be non-empty".to_string(),
            ));
        }
        Ok(Self { inner, key })
    }

    fn apply_key(&self, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()];
        }
    }
}

impl BlockDevice for XorEncryptedDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_block(block, buf)?;
        self.apply_key(buf);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size(), self.block_count())?;
        let mut ciphertext = data.to_vec();
        self.apply_key(&mut ciphertext);
        self.inner.write_block(block, &ciphertext)
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Encrypted
    }
}

/// Pass-through placeholder for a compressing device.
///
/// Fixed-size blocks leave no room for in-place compression without a
/// block-mapping layer, so this wrapper currently forwards unchanged and
/// exists to reserve the seam.
pub struct CompressedDevice {
    inner: Arc<dyn BlockDevice>,
}

impl CompressedDevice {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self { inner }
    }
}

impl BlockDevice for CompressedDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_block(block, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Compressed
    }
}

/// One tier of a [`TieredDevice`]: blocks below `cutoff` (and at or above
/// the previous tier's cutoff) route to `device`.
pub struct Tier {
    pub cutoff: u64,
    pub device: Arc<dyn BlockDevice>,
}

/// Routes block ranges to different underlying devices by ascending
/// cutoffs. Tier `i` serves logical blocks `[cutoff[i-1], cutoff[i])`,
/// remapped to local block numbers starting at zero.
pub struct TieredDevice {
    tiers: Vec<Tier>,
    block_size: usize,
    block_count: u64,
}

impl TieredDevice {
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(BlockDeviceError::InvalidGeometry(
                "tiered device requires at least one tier".to_string(),
            ));
        }
        let block_size = tiers[0].device.block_size();
        let mut prev_cutoff = 0u64;
        for (i, tier) in tiers.iter().enumerate() {
            if tier.device.block_size() != block_size {
                return Err(BlockDeviceError::InvalidGeometry(format!(
                    "tier {} block size {} does not match {}",
                    i,
                    tier.device.block_size(),
                    block_size
                )));
            }
            if tier.cutoff <= prev_cutoff {
                return Err(BlockDeviceError::InvalidGeometry(format!(
                    "tier {} cutoff {} is not strictly ascending",
                    i, tier.cutoff
                )));
            }
            let span = tier.cutoff - prev_cutoff;
            if span > tier.device.block_count() {
                return Err(BlockDeviceError::InvalidGeometry(format!(
                    "tier {} spans {} blocks but its device holds {}",
                    i,
                    span,
                    tier.device.block_count()
                )));
            }
            prev_cutoff = tier.cutoff;
        }
        let block_count = prev_cutoff;
        Ok(Self {
            tiers,
            block_size,
            block_count,
        })
    }

    fn route(&self, block: u64) -> (&Tier, u64) {
        let mut prev_cutoff = 0u64;
        for tier in &self.tiers {
            if block < tier.cutoff {
                return (tier, block - prev_cutoff);
            }
            prev_cutoff = tier.cutoff;
        }
        // check_io has already bounded `block` below the last cutoff
        unreachable!("block {} beyond final tier cutoff", block)
    }
}

impl BlockDevice for TieredDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let (tier, local) = self.route(block);
        tier.device.read_block(local, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let (tier, local) = self.route(block);
        tier.device.write_block(local, data)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn flush(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.device.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.device.close()?;
        }
        Ok(())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Tiered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    fn memory(block_count: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemoryBlockDevice::new(64, block_count).unwrap())
    }

    #[test]
    fn read_only_rejects_writes() {
        let inner = memory(4);
        inner.write_block(1, &[7u8; 64]).unwrap();

        let device = ReadOnlyDevice::new(inner);
        assert!(matches!(
            device.write_block(1, &[0u8; 64]),
            Err(BlockDeviceError::ReadOnly)
        ));

        let mut buf = [0u8; 64];
        device.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 64]);
    }

    #[test]
    fn xor_round_trip_and_ciphertext_differs() {
        let inner = memory(4);
        let device = XorEncryptedDevice::new(inner.clone(), b"secret".to_vec()).unwrap();

        let plaintext = [0x42u8; 64];
        device.write_block(2, &plaintext).unwrap();

        let mut decrypted = [0u8; 64];
        device.read_block(2, &mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);

        // Raw device must hold transformed bytes, not the plaintext.
        let mut raw = [0u8; 64];
        inner.read_block(2, &mut raw).unwrap();
        assert_ne!(raw, plaintext);
    }

    #[test]
    fn xor_rejects_empty_key() {
        assert!(XorEncryptedDevice::new(memory(4), Vec::new()).is_err());
    }

    #[test]
    fn compressed_is_pass_through() {
        let device = CompressedDevice::new(memory(4));
        let data = [0x17u8; 64];
        device.write_block(0, &data).unwrap();

        let mut buf = [0u8; 64];
        device.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn tiered_routes_by_cutoff() {
        let fast = memory(4);
        let slow = memory(8);
        let device = TieredDevice::new(vec![
            Tier {
                cutoff: 4,
                device: fast.clone(),
            },
            Tier {
                cutoff: 12,
                device: slow.clone(),
            },
        ])
        .unwrap();

        assert_eq!(device.block_count(), 12);

        device.write_block(2, &[1u8; 64]).unwrap();
        device.write_block(5, &[2u8; 64]).unwrap();

        let mut buf = [0u8; 64];
        fast.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 64]);

        // Logical block 5 lands at local block 1 of the second tier.
        slow.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 64]);
    }

    #[test]
    fn tiered_rejects_bad_layouts() {
        assert!(TieredDevice::new(Vec::new()).is_err());

        // Descending cutoffs
        assert!(TieredDevice::new(vec![
            Tier {
                cutoff: 8,
                device: memory(8),
            },
            Tier {
                cutoff: 4,
                device: memory(8),
            },
        ])
        .is_err());

        // Tier span exceeds member capacity
        assert!(TieredDevice::new(vec![Tier {
            cutoff: 100,
            device: memory(8),
        }])
        .is_err());
    }
}
