use crate::buffer::Buffer;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideDataType {
    NewExtradata,
    ParamChange,
    DisplayMatrix,
    Stereo3d,
    ReplayGain,
    MasteringDisplay,
    ContentLightLevel,
    IccProfile,
    SeiUnregistered,
    SkipSamples,
    Custom(u32),
}

pub struct SideDataDescriptor {
    pub name: &'static str,
    /// More than one entry of the type may coexist.
    pub multi: bool,
}

impl SideDataType {
    pub fn descriptor(&self) -> SideDataDescriptor {
        let (name, multi) = match self {
            SideDataType::NewExtradata => ("New extradata", false),
            SideDataType::ParamChange => ("Parameter change", false),
            SideDataType::DisplayMatrix => ("3x3 displaymatrix", false),
            SideDataType::Stereo3d => ("Stereo 3D", false),
            SideDataType::ReplayGain => ("AVReplayGain", false),
            SideDataType::MasteringDisplay => ("Mastering display metadata", false),
            SideDataType::ContentLightLevel => ("Content light level metadata", false),
            SideDataType::IccProfile => ("ICC profile", false),
            SideDataType::SeiUnregistered => ("User Data Unregistered SEI message", true),
            SideDataType::SkipSamples => ("Skip samples", false),
            SideDataType::Custom(_) => ("Custom", false),
        };
        SideDataDescriptor { name, multi }
    }
}

#[derive(Debug, Clone)]
pub struct SideData {
    pub kind: SideDataType,
    pub buf: Buffer,
}

/// Small ordered array of typed side-data entries, each owning its payload.
#[derive(Debug, Clone, Default)]
pub struct SideDataList {
    entries: Vec<SideData>,
}

impl SideDataList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `buf` under `kind`. For single-instance types an existing entry
    /// has its payload replaced (the old payload is released first).
    pub fn add(&mut self, kind: SideDataType, buf: Buffer) -> &mut SideData {
        let multi = kind.descriptor().multi;
        if !multi {
            if let Some(pos) = self.entries.iter().position(|e| e.kind == kind) {
                let entry = &mut self.entries[pos];
                entry.buf.unref();
                entry.buf = buf;
                return entry;
            }
        }
        self.entries.push(SideData { kind, buf });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    /// Allocates a zeroed payload of `size` bytes and adds it.
    pub fn new_entry(&mut self, kind: SideDataType, size: usize) -> Result<&mut SideData> {
        let buf = Buffer::try_alloc(size)?;
        Ok(self.add(kind, buf))
    }

    pub fn get(&self, kind: SideDataType) -> Option<&SideData> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    pub fn get_all(&self, kind: SideDataType) -> impl Iterator<Item = &SideData> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Removes every entry of `kind`, keeping the rest in order.
    pub fn remove(&mut self, kind: SideDataType) {
        self.entries.retain(|e| e.kind != kind);
    }

    /// Adds a new reference to `src`'s payload.
    pub fn clone_entry(&mut self, src: &SideData) {
        self.add(src.kind, src.buf.ref_buffer());
    }

    pub fn free_all(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SideData> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
