//! PDB stream container.
//!
//! Just enough MSF 7.0 to satisfy the rewriter: read the numbered streams,
//! replace one, rewrite the GUID and age in the header-signature stream so
//! the PDB matches the debug directory stamped into the rewritten image,
//! and write the container back with every untouched stream byte-identical.

use anyhow::{bail, Context, Result};

use crate::pe::parser::DebugId;

const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";
const SUPERBLOCK_SIZE: usize = 32 + 6 * 4;
/// Stream 1 carries the PDB header signature (version, timestamp, age,
/// GUID).
const HEADER_STREAM: usize = 1;
const NIL_STREAM_SIZE: u32 = 0xffff_ffff;

pub struct PdbFile {
    block_size: u32,
    /// `None` marks a nil stream, which must survive a round-trip as nil.
    streams: Vec<Option<Vec<u8>>>,
}

impl PdbFile {
    pub fn parse(data: &[u8]) -> Result<PdbFile> {
        if data.len() < SUPERBLOCK_SIZE || &data[..32] != MSF_MAGIC {
            bail!("not an MSF 7.0 file");
        }
        let u32_at = |offset: usize| -> Result<u32> {
            data.get(offset..offset + 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .with_context(|| format!("truncated MSF at offset {offset:#x}"))
        };
        let block_size = u32_at(32)?;
        if !block_size.is_power_of_two() || !(0x200..=0x1000).contains(&block_size) {
            bail!("unsupported MSF block size {block_size:#x}");
        }
        let num_blocks = u32_at(40)?;
        if num_blocks as usize * block_size as usize > data.len() {
            bail!("MSF claims more blocks than the file holds");
        }
        let directory_bytes = u32_at(44)?;
        let block_map_addr = u32_at(52)?;

        let read_block = |index: u32| -> Result<&[u8]> {
            if index >= num_blocks {
                bail!("block index {index} out of range");
            }
            let start = index as usize * block_size as usize;
            Ok(&data[start..start + block_size as usize])
        };
        let blocks_for = |bytes: u32| bytes.div_ceil(block_size);

        // The block map lists the directory's blocks; the directory lists
        // everyone else's.
        let map = read_block(block_map_addr)?;
        let mut directory = Vec::with_capacity(directory_bytes as usize);
        for i in 0..blocks_for(directory_bytes) as usize {
            let index = u32::from_le_bytes(map[i * 4..i * 4 + 4].try_into().unwrap());
            directory.extend_from_slice(read_block(index)?);
        }
        directory.truncate(directory_bytes as usize);

        let dir_u32 = |i: usize| -> Result<u32> {
            directory
                .get(i * 4..i * 4 + 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .context("truncated stream directory")
        };
        let num_streams = dir_u32(0)? as usize;
        let mut streams = Vec::with_capacity(num_streams);
        let mut cursor = 1 + num_streams; // past the size table
        for s in 0..num_streams {
            let size = dir_u32(1 + s)?;
            if size == NIL_STREAM_SIZE {
                streams.push(None);
                continue;
            }
            let mut bytes = Vec::with_capacity(size as usize);
            for _ in 0..blocks_for(size) {
                bytes.extend_from_slice(read_block(dir_u32(cursor)?)?);
                cursor += 1;
            }
            bytes.truncate(size as usize);
            streams.push(Some(bytes));
        }
        Ok(PdbFile { block_size, streams })
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<&[u8]> {
        self.streams.get(index)?.as_deref()
    }

    pub fn replace_stream(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        let slot = self
            .streams
            .get_mut(index)
            .with_context(|| format!("no stream {index}"))?;
        *slot = Some(data);
        Ok(())
    }

    /// GUID and age from the header-signature stream.
    pub fn debug_id(&self) -> Result<DebugId> {
        let header = self
            .stream(HEADER_STREAM)
            .context("PDB has no header stream")?;
        if header.len() < 28 {
            bail!("PDB header stream is truncated");
        }
        let age = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&header[12..28]);
        Ok(DebugId { guid, age })
    }

    /// Stamps `id` into the header-signature stream; everything else in
    /// the stream is preserved.
    pub fn set_debug_id(&mut self, id: &DebugId) -> Result<()> {
        let header = self
            .streams
            .get_mut(HEADER_STREAM)
            .and_then(|s| s.as_mut())
            .context("PDB has no header stream")?;
        if header.len() < 28 {
            bail!("PDB header stream is truncated");
        }
        header[8..12].copy_from_slice(&id.age.to_le_bytes());
        header[12..28].copy_from_slice(&id.guid);
        Ok(())
    }

    /// Re-emits the container. The block layout is rebuilt from scratch;
    /// stream payloads are written exactly as held.
    pub fn write(&self) -> Result<Vec<u8>> {
        let bs = self.block_size as usize;

        // Blocks 0..3 are superblock and the two free-page maps.
        let mut out = vec![0u8; 3 * bs];
        let mut stream_blocks: Vec<Vec<u32>> = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let mut indices = Vec::new();
            if let Some(bytes) = stream {
                for chunk in bytes.chunks(bs) {
                    indices.push((out.len() / bs) as u32);
                    let mut block = chunk.to_vec();
                    block.resize(bs, 0);
                    out.extend_from_slice(&block);
                }
            }
            stream_blocks.push(indices);
        }

        // Stream directory.
        let mut directory = Vec::new();
        directory.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        for stream in &self.streams {
            let size = match stream {
                Some(bytes) => bytes.len() as u32,
                None => NIL_STREAM_SIZE,
            };
            directory.extend_from_slice(&size.to_le_bytes());
        }
        for indices in &stream_blocks {
            for &index in indices {
                directory.extend_from_slice(&index.to_le_bytes());
            }
        }
        let directory_bytes = directory.len() as u32;

        let mut map = Vec::new();
        for chunk in directory.chunks(bs) {
            map.push((out.len() / bs) as u32);
            let mut block = chunk.to_vec();
            block.resize(bs, 0);
            out.extend_from_slice(&block);
        }
        if map.len() * 4 > bs {
            bail!("stream directory too large for one block map");
        }
        let block_map_addr = (out.len() / bs) as u32;
        let mut map_block = Vec::with_capacity(bs);
        for index in &map {
            map_block.extend_from_slice(&index.to_le_bytes());
        }
        map_block.resize(bs, 0);
        out.extend_from_slice(&map_block);

        let num_blocks = (out.len() / bs) as u32;

        // Superblock.
        out[..32].copy_from_slice(MSF_MAGIC);
        out[32..36].copy_from_slice(&self.block_size.to_le_bytes());
        out[36..40].copy_from_slice(&1u32.to_le_bytes()); // active FPM
        out[40..44].copy_from_slice(&num_blocks.to_le_bytes());
        out[44..48].copy_from_slice(&directory_bytes.to_le_bytes());
        out[48..52].copy_from_slice(&0u32.to_le_bytes());
        out[52..56].copy_from_slice(&block_map_addr.to_le_bytes());
        // Mark every page used in the active free-page map.
        let fpm_start = bs;
        for b in out[fpm_start..fpm_start + bs].iter_mut() {
            *b = 0;
        }
        Ok(out)
    }
}
