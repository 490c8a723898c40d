//! In-process host resources and the upload translator.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use hardshadow_core::{HostBuffer, HostTexture};

use super::{
    ResourceObserver, ResourceOrigin, ResourceTranslator, TranslatedBuffer, TranslatedTexture,
};
use crate::backend::{CommandList, GpuBuffer, GpuTexture, RtBackend};
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceValue, QueueKind, QueueScheduler};
use crate::types::{BufferDescriptor, BufferUsage, RenderTargetFormat, TextureDescriptor};

/// Uploads `bytes` into a new device-local buffer through the copy queue.
pub fn upload_bytes(
    scheduler: &QueueScheduler,
    label: &str,
    bytes: &[u8],
    usage: BufferUsage,
) -> RaytraceResult<(Arc<GpuBuffer>, FenceValue)> {
    let size = (bytes.len() as u64).max(4).next_multiple_of(4);
    let buffer = Arc::new(
        scheduler.backend().create_buffer(
            &BufferDescriptor::new(size, usage | BufferUsage::COPY_DST).with_label(label),
        )?,
    );
    let mut list = CommandList::new(format!("upload {label}"));
    if !bytes.is_empty() {
        list.upload(&buffer, 0, bytes);
    }
    let ready = scheduler.submit(QueueKind::Copy, list, FenceValue::NONE)?;
    Ok((buffer, ready))
}

#[derive(Debug)]
struct HostBufferData {
    bytes: Arc<[u8]>,
    observers: Vec<Weak<dyn ResourceObserver>>,
}

#[derive(Debug)]
struct HostTextureData {
    width: u32,
    height: u32,
    format: RenderTargetFormat,
    bytes: Vec<u8>,
    observers: Vec<Weak<dyn ResourceObserver>>,
}

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    buffers: HashMap<HostBuffer, HostBufferData>,
    textures: HashMap<HostTexture, HostTextureData>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Host-side buffers and textures living in process memory.
///
/// Stands in for the resources of the host graphics device: mutation and
/// release notify every observer registered by a translator.
#[derive(Debug, Default)]
pub struct HostResources {
    state: Mutex<HostState>,
}

fn notify(observers: Vec<Weak<dyn ResourceObserver>>, event: impl Fn(&dyn ResourceObserver)) {
    for observer in observers.iter().filter_map(Weak::upgrade) {
        event(observer.as_ref());
    }
}

impl HostResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_buffer(&self, bytes: impl Into<Arc<[u8]>>) -> HostBuffer {
        let mut state = self.state.lock();
        let id = HostBuffer(state.next_id());
        state.buffers.insert(
            id,
            HostBufferData {
                bytes: bytes.into(),
                observers: Vec::new(),
            },
        );
        id
    }

    pub fn buffer_data(&self, buffer: HostBuffer) -> Option<Arc<[u8]>> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| Arc::clone(&b.bytes))
    }

    /// Replaces the contents of a buffer and notifies its observers.
    pub fn update_buffer(&self, buffer: HostBuffer, bytes: impl Into<Arc<[u8]>>) -> bool {
        let observers = {
            let mut state = self.state.lock();
            let Some(data) = state.buffers.get_mut(&buffer) else {
                return false;
            };
            data.bytes = bytes.into();
            data.observers.clone()
        };
        notify(observers, |o| o.buffer_updated(buffer));
        true
    }

    pub fn release_buffer(&self, buffer: HostBuffer) -> bool {
        let removed = self.state.lock().buffers.remove(&buffer);
        match removed {
            Some(data) => {
                notify(data.observers, |o| o.buffer_released(buffer));
                true
            }
            None => false,
        }
    }

    pub fn create_texture(&self, width: u32, height: u32, format: RenderTargetFormat) -> HostTexture {
        let mut state = self.state.lock();
        let id = HostTexture(state.next_id());
        let size = TextureDescriptor::new(width, height, format).data_size();
        state.textures.insert(
            id,
            HostTextureData {
                width,
                height,
                format,
                bytes: vec![0; size],
                observers: Vec::new(),
            },
        );
        id
    }

    /// Returns the size and format of a texture.
    pub fn texture_info(&self, texture: HostTexture) -> Option<(u32, u32, RenderTargetFormat)> {
        self.state
            .lock()
            .textures
            .get(&texture)
            .map(|t| (t.width, t.height, t.format))
    }

    pub fn texture_data(&self, texture: HostTexture) -> Option<Vec<u8>> {
        self.state
            .lock()
            .textures
            .get(&texture)
            .map(|t| t.bytes.clone())
    }

    pub fn release_texture(&self, texture: HostTexture) -> bool {
        let removed = self.state.lock().textures.remove(&texture);
        match removed {
            Some(data) => {
                notify(data.observers, |o| o.texture_released(texture));
                true
            }
            None => false,
        }
    }

    fn observe_buffer(&self, buffer: HostBuffer, observer: &Arc<dyn ResourceObserver>) {
        if let Some(data) = self.state.lock().buffers.get_mut(&buffer) {
            data.observers.retain(|o| o.strong_count() > 0);
            data.observers.push(Arc::downgrade(observer));
        }
    }

    fn observe_texture(&self, texture: HostTexture, observer: &Arc<dyn ResourceObserver>) {
        if let Some(data) = self.state.lock().textures.get_mut(&texture) {
            data.observers.retain(|o| o.strong_count() > 0);
            data.observers.push(Arc::downgrade(observer));
        }
    }

    fn write_texture(&self, texture: HostTexture, bytes: Vec<u8>) -> RaytraceResult<()> {
        let mut state = self.state.lock();
        let data = state
            .textures
            .get_mut(&texture)
            .ok_or_else(|| unknown_texture(texture))?;
        if data.bytes.len() != bytes.len() {
            return Err(RaytraceError::InvalidParameter(format!(
                "host texture {} holds {} bytes, got {}",
                texture.0,
                data.bytes.len(),
                bytes.len()
            )));
        }
        data.bytes = bytes;
        Ok(())
    }
}

fn unknown_buffer(buffer: HostBuffer) -> RaytraceError {
    RaytraceError::InvalidParameter(format!("unknown host buffer {}", buffer.0))
}

fn unknown_texture(texture: HostTexture) -> RaytraceError {
    RaytraceError::InvalidParameter(format!("unknown host texture {}", texture.0))
}

/// Translator that uploads CPU copies of [`HostResources`].
#[derive(Debug, Clone)]
pub struct UploadTranslator {
    host: Arc<HostResources>,
}

impl UploadTranslator {
    pub fn new(host: Arc<HostResources>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<HostResources> {
        &self.host
    }
}

impl ResourceTranslator for UploadTranslator {
    fn translate_buffer(
        &self,
        scheduler: &QueueScheduler,
        buffer: HostBuffer,
        observer: Arc<dyn ResourceObserver>,
    ) -> RaytraceResult<TranslatedBuffer> {
        let bytes = self
            .host
            .buffer_data(buffer)
            .ok_or_else(|| unknown_buffer(buffer))?;
        let (device, ready) = upload_bytes(
            scheduler,
            &format!("host buffer {}", buffer.0),
            &bytes,
            BufferUsage::STORAGE | BufferUsage::ACCEL_INPUT | BufferUsage::COPY_SRC,
        )?;
        self.host.observe_buffer(buffer, &observer);
        log::debug!(
            "Translated host buffer {} ({} bytes) by upload",
            buffer.0,
            bytes.len()
        );
        Ok(TranslatedBuffer {
            host: buffer,
            size: bytes.len() as u64,
            buffer: device,
            origin: ResourceOrigin::Uploaded,
            ready,
        })
    }

    fn refresh_buffer(
        &self,
        scheduler: &QueueScheduler,
        translated: &TranslatedBuffer,
    ) -> RaytraceResult<FenceValue> {
        let bytes = self
            .host
            .buffer_data(translated.host)
            .ok_or_else(|| unknown_buffer(translated.host))?;
        if bytes.len() as u64 != translated.size {
            return Err(RaytraceError::InvalidParameter(format!(
                "host buffer {} changed size from {} to {}",
                translated.host.0,
                translated.size,
                bytes.len()
            )));
        }
        let mut list = CommandList::new(format!("refresh host buffer {}", translated.host.0));
        list.upload(&translated.buffer, 0, &bytes);
        scheduler.submit(QueueKind::Copy, list, FenceValue::NONE)
    }

    fn translate_texture(
        &self,
        scheduler: &QueueScheduler,
        texture: HostTexture,
        observer: Arc<dyn ResourceObserver>,
    ) -> RaytraceResult<TranslatedTexture> {
        let (width, height, format) = self
            .host
            .texture_info(texture)
            .ok_or_else(|| unknown_texture(texture))?;
        let device: GpuTexture = scheduler.backend().create_texture(
            &TextureDescriptor::new(width, height, format)
                .with_label(format!("host texture {}", texture.0)),
        )?;
        self.host.observe_texture(texture, &observer);
        Ok(TranslatedTexture {
            host: texture,
            texture: Arc::new(device),
            origin: ResourceOrigin::Uploaded,
            ready: FenceValue::NONE,
        })
    }

    fn publish_texture(
        &self,
        scheduler: &QueueScheduler,
        source: &Arc<GpuTexture>,
        target: HostTexture,
        after: FenceValue,
    ) -> RaytraceResult<FenceValue> {
        scheduler.wait(after)?;
        let bytes = scheduler.backend().read_texture(source)?;
        self.host.write_texture(target, bytes)?;
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ResourceObserver for Recorder {
        fn buffer_updated(&self, buffer: HostBuffer) {
            self.events.lock().push(format!("updated {}", buffer.0));
        }

        fn buffer_released(&self, buffer: HostBuffer) {
            self.events.lock().push(format!("released {}", buffer.0));
        }

        fn texture_released(&self, texture: HostTexture) {
            self.events.lock().push(format!("texture released {}", texture.0));
        }
    }

    fn setup() -> (Arc<SoftwareBackend>, QueueScheduler, UploadTranslator) {
        let backend = Arc::new(SoftwareBackend::new());
        let scheduler = QueueScheduler::new(backend.clone(), Duration::from_secs(1));
        let translator = UploadTranslator::new(Arc::new(HostResources::new()));
        (backend, scheduler, translator)
    }

    #[test]
    fn test_translate_uploads_and_observes() {
        let (backend, scheduler, translator) = setup();
        let host = translator.host().create_buffer(vec![1u8, 2, 3, 4]);
        let recorder = Arc::new(Recorder::default());

        let translated = translator
            .translate_buffer(&scheduler, host, recorder.clone())
            .unwrap();
        assert_eq!(translated.origin, ResourceOrigin::Uploaded);
        assert!(!translated.ready.is_none());
        scheduler.wait(translated.ready).unwrap();
        assert_eq!(
            backend.read_buffer(&translated.buffer, 0, 4).unwrap(),
            vec![1, 2, 3, 4]
        );

        translator.host().update_buffer(host, vec![5u8, 6, 7, 8]);
        let ready = translator.refresh_buffer(&scheduler, &translated).unwrap();
        scheduler.wait(ready).unwrap();
        assert_eq!(
            backend.read_buffer(&translated.buffer, 0, 4).unwrap(),
            vec![5, 6, 7, 8]
        );

        translator.host().release_buffer(host);
        assert_eq!(
            *recorder.events.lock(),
            vec!["updated 1".to_string(), "released 1".to_string()]
        );
    }

    #[test]
    fn test_dropped_observer_is_not_called() {
        let (_backend, scheduler, translator) = setup();
        let host = translator.host().create_buffer(vec![0u8; 8]);
        let recorder = Arc::new(Recorder::default());
        translator
            .translate_buffer(&scheduler, host, recorder.clone())
            .unwrap();
        let weak = Arc::downgrade(&recorder);
        drop(recorder);
        assert!(translator.host().update_buffer(host, vec![1u8; 8]));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_refresh_rejects_resize() {
        let (_backend, scheduler, translator) = setup();
        let host = translator.host().create_buffer(vec![0u8; 8]);
        let translated = translator
            .translate_buffer(&scheduler, host, Arc::new(Recorder::default()))
            .unwrap();
        translator.host().update_buffer(host, vec![0u8; 16]);
        assert!(translator.refresh_buffer(&scheduler, &translated).is_err());
    }

    #[test]
    fn test_publish_texture() {
        let (backend, scheduler, translator) = setup();
        let host = translator
            .host()
            .create_texture(2, 1, RenderTargetFormat::Ru8);
        let translated = translator
            .translate_texture(&scheduler, host, Arc::new(Recorder::default()))
            .unwrap();
        let published = translator
            .publish_texture(&scheduler, &translated.texture, host, FenceValue::NONE)
            .unwrap();
        assert!(published.is_none());
        assert_eq!(translator.host().texture_data(host).unwrap(), vec![0, 0]);
        assert_eq!(backend.read_texture(&translated.texture).unwrap().len(), 2);
    }
}
