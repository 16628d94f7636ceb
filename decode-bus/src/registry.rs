//! Lookup tables for bitstream filters and decode accelerators. A registry
//! is built explicitly and handed to the decoder; nothing here is global.

use std::collections::HashMap;

use crate::accel::AccelDescriptor;
use crate::bsf::{BitstreamFilter, ChunkFilter, FilterOptions, Mp4ToAnnexB, NullFilter};
use crate::error::{Error, Result};

pub type FilterFactory = fn(&FilterOptions) -> Result<Box<dyn BitstreamFilter>>;

#[derive(Clone, Default)]
pub struct Registry {
    filters: HashMap<&'static str, FilterFactory>,
    accels: HashMap<String, Vec<AccelDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_filter("null", |_| Ok(Box::new(NullFilter)));
        registry.register_filter("mp4toannexb", |_| Ok(Box::new(Mp4ToAnnexB::default())));
        registry.register_filter("chunk", |opts| {
            Ok(Box::new(ChunkFilter::new(opts.get_usize("size", 1024)?)?))
        });

        let table: &[(&str, &[AccelDescriptor])] = &[
            (
                "h264",
                &[
                    AccelDescriptor::new("h264_cuvid", false, true),
                    AccelDescriptor::new("h264_qsv", true, false),
                    AccelDescriptor::new("h264_v4l2m2m", false, false),
                ],
            ),
            (
                "hevc",
                &[
                    AccelDescriptor::new("hevc_cuvid", false, true),
                    AccelDescriptor::new("hevc_qsv", true, false),
                    AccelDescriptor::new("hevc_v4l2m2m", false, false),
                ],
            ),
            (
                "vp9",
                &[
                    AccelDescriptor::new("vp9_cuvid", false, true),
                    AccelDescriptor::new("vp9_qsv", true, false),
                ],
            ),
            (
                "av1",
                &[
                    AccelDescriptor::new("av1_cuvid", false, true),
                    AccelDescriptor::new("av1_qsv", true, false),
                ],
            ),
        ];
        for (codec_id, descriptors) in table {
            for desc in descriptors.iter() {
                registry.register_accel(codec_id, desc.clone());
            }
        }
        registry
    }

    pub fn register_filter(&mut self, name: &'static str, factory: FilterFactory) {
        self.filters.insert(name, factory);
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn create_filter(&self, name: &str, opts: &FilterOptions) -> Result<Box<dyn BitstreamFilter>> {
        match self.filters.get(name) {
            Some(factory) => factory(opts),
            None => {
                log::error!("unknown bitstream filter: {}", name);
                Err(Error::FilterNotFound(name.to_string()))
            }
        }
    }

    pub fn register_accel(&mut self, codec_id: &str, desc: AccelDescriptor) {
        self.accels.entry(codec_id.to_string()).or_default().push(desc);
    }

    /// Finds the accelerator `name` for `codec_id`, or the first one
    /// registered for the codec when `name` is `"auto"`.
    pub fn find_accel(&self, codec_id: &str, name: &str) -> Option<AccelDescriptor> {
        let candidates = self.accels.get(codec_id)?;
        let found = if name == "auto" {
            candidates.first()
        } else {
            candidates.iter().find(|d| d.name == name)
        };
        if let Some(desc) = found {
            log::info!("found decode accelerator: {}", desc.name);
        }
        found.cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut filters: Vec<_> = self.filters.keys().collect();
        filters.sort();
        f.debug_struct("Registry")
            .field("filters", &filters)
            .field("accels", &self.accels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_filters() -> anyhow::Result<()> {
        let registry = Registry::with_builtins();
        assert!(registry.has_filter("null"));
        assert!(registry.has_filter("mp4toannexb"));
        let chunk = registry.create_filter("chunk", &FilterOptions::default())?;
        assert_eq!(chunk.name(), "chunk");

        let mut opts = FilterOptions::default();
        opts.insert("size", "0");
        assert!(matches!(
            registry.create_filter("chunk", &opts).err(),
            Some(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_find_accel() {
        let mut registry = Registry::with_builtins();
        let auto = registry.find_accel("h264", "auto").unwrap();
        assert_eq!(auto.name, "h264_cuvid");
        assert!(!auto.thread_safe);
        let qsv = registry.find_accel("hevc", "hevc_qsv").unwrap();
        assert!(qsv.thread_safe && !qsv.async_safe);
        assert!(registry.find_accel("raw", "auto").is_none());

        registry.register_accel("raw", AccelDescriptor::new("raw_serial", false, true));
        assert!(registry.find_accel("raw", "raw_serial").is_some());
    }

    #[test]
    fn test_registries_are_independent() {
        let mut a = Registry::new();
        let b = Registry::with_builtins();
        a.register_filter("null", |_| Ok(Box::new(NullFilter)));
        assert!(!a.has_filter("chunk"));
        assert!(b.has_filter("chunk"));
    }
}
