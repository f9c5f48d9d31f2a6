//! Binding of real LV2 binaries through their C ABI.
//!
//! Descriptions come from a scan cache; the shared object is opened with
//! `libloading` the first time one of its plugins is instantiated and stays
//! loaded for the lifetime of the world.

use super::descriptor::{
    HostFeatures, Lv2Catalog, Lv2Instance, Lv2OptionValue, Lv2OptionsInterface, Lv2PluginInfo,
    Lv2ProgramsInterface, Lv2StateInterface, Lv2Status, Lv2Worker, PortBuffers,
    LV2_FEATURE_BOUNDED_BLOCK_LENGTH, LV2_FEATURE_FIXED_BLOCK_LENGTH, LV2_FEATURE_OPTIONS,
    LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH, LV2_FEATURE_STATE_FREE_PATH, LV2_FEATURE_STATE_MAKE_PATH,
    LV2_FEATURE_STATE_MAP_PATH, LV2_FEATURE_URID_MAP, LV2_FEATURE_URID_UNMAP,
    LV2_FEATURE_WORKER_SCHEDULE,
};
use super::state::PathMapper;
use super::urid::{
    UridMap, URID_ATOM_FLOAT, URID_ATOM_INT, URID_BUF_MAX_LENGTH, URID_BUF_MIN_LENGTH,
    URID_BUF_NOMINAL_LENGTH, URID_BUF_SEQUENCE_SIZE, URID_PARAM_SAMPLE_RATE,
};
use super::worker::WorkerSchedule;
use crate::error::{LoadStage, PluginError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

const LV2_WORKER_INTERFACE: &CStr = c"http://lv2plug.in/ns/ext/worker#interface";
const LV2_STATE_INTERFACE: &CStr = c"http://lv2plug.in/ns/ext/state#interface";
const LV2_PROGRAMS_INTERFACE: &CStr = c"http://kxstudio.sf.net/ns/lv2ext/programs#Interface";
const LV2_OPTIONS_INTERFACE: &CStr = c"http://lv2plug.in/ns/ext/options#interface";

const LV2_OPTIONS_INSTANCE: u32 = 0;

#[repr(C)]
struct RawFeature {
    uri: *const c_char,
    data: *mut c_void,
}

#[repr(C)]
struct RawDescriptor {
    uri: *const c_char,
    instantiate: Option<
        unsafe extern "C" fn(
            *const RawDescriptor,
            f64,
            *const c_char,
            *const *const RawFeature,
        ) -> *mut c_void,
    >,
    connect_port: Option<unsafe extern "C" fn(*mut c_void, u32, *mut c_void)>,
    activate: Option<unsafe extern "C" fn(*mut c_void)>,
    run: Option<unsafe extern "C" fn(*mut c_void, u32)>,
    deactivate: Option<unsafe extern "C" fn(*mut c_void)>,
    cleanup: Option<unsafe extern "C" fn(*mut c_void)>,
    extension_data: Option<unsafe extern "C" fn(*const c_char) -> *const c_void>,
}

type DescriptorFn = unsafe extern "C" fn(u32) -> *const RawDescriptor;

#[repr(C)]
struct RawUridMap {
    handle: *mut c_void,
    map: unsafe extern "C" fn(*mut c_void, *const c_char) -> u32,
}

#[repr(C)]
struct RawUridUnmap {
    handle: *mut c_void,
    unmap: unsafe extern "C" fn(*mut c_void, u32) -> *const c_char,
}

type RespondFn = unsafe extern "C" fn(*mut c_void, u32, *const c_void) -> u32;

#[repr(C)]
struct RawWorkerSchedule {
    handle: *mut c_void,
    schedule_work: RespondFn,
}

#[repr(C)]
struct RawWorkerInterface {
    work: unsafe extern "C" fn(*mut c_void, RespondFn, *mut c_void, u32, *const c_void) -> u32,
    work_response: unsafe extern "C" fn(*mut c_void, u32, *const c_void) -> u32,
    end_run: Option<unsafe extern "C" fn(*mut c_void) -> u32>,
}

type StoreFn = unsafe extern "C" fn(*mut c_void, u32, *const c_void, usize, u32, u32) -> u32;
type RetrieveFn =
    unsafe extern "C" fn(*mut c_void, u32, *mut usize, *mut u32, *mut u32) -> *const c_void;

#[repr(C)]
struct RawStateInterface {
    save: unsafe extern "C" fn(*mut c_void, StoreFn, *mut c_void, u32, *const *const RawFeature) -> u32,
    restore:
        unsafe extern "C" fn(*mut c_void, RetrieveFn, *mut c_void, u32, *const *const RawFeature) -> u32,
}

#[repr(C)]
struct RawMapPath {
    handle: *mut c_void,
    abstract_path: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_char,
    absolute_path: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_char,
}

#[repr(C)]
struct RawMakePath {
    handle: *mut c_void,
    path: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_char,
}

#[repr(C)]
struct RawFreePath {
    handle: *mut c_void,
    free_path: unsafe extern "C" fn(*mut c_void, *mut c_char),
}

#[repr(C)]
struct RawProgramDescriptor {
    bank: u32,
    program: u32,
    name: *const c_char,
}

#[repr(C)]
struct RawProgramsInterface {
    get_program: unsafe extern "C" fn(*mut c_void, u32) -> *const RawProgramDescriptor,
    select_program: unsafe extern "C" fn(*mut c_void, u32, u32),
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawOption {
    context: u32,
    subject: u32,
    key: u32,
    size: u32,
    value_type: u32,
    value: *const c_void,
}

impl RawOption {
    const END: RawOption = RawOption {
        context: 0,
        subject: 0,
        key: 0,
        size: 0,
        value_type: 0,
        value: ptr::null(),
    };
}

#[repr(C)]
struct RawOptionsInterface {
    get: unsafe extern "C" fn(*mut c_void, *mut RawOption) -> u32,
    set: unsafe extern "C" fn(*mut c_void, *const RawOption) -> u32,
}

fn status_from_raw(status: u32) -> Lv2Status {
    match status {
        0 => Lv2Status::Success,
        2 => Lv2Status::NoSpace,
        1 => Lv2Status::Error,
        _ => Lv2Status::Unknown,
    }
}

fn status_to_raw(status: Lv2Status) -> u32 {
    match status {
        Lv2Status::Success => 0,
        Lv2Status::NoSpace => 2,
        Lv2Status::Error | Lv2Status::Unknown => 1,
    }
}

unsafe fn str_arg<'a>(text: *const c_char) -> Option<&'a str> {
    if text.is_null() {
        return None;
    }
    CStr::from_ptr(text).to_str().ok()
}

fn path_to_raw(path: &Path) -> *mut c_char {
    CString::new(path.to_string_lossy().into_owned())
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}

/// URID map/unmap handle; keeps unmapped strings alive for the plugin.
struct UridHandle {
    urids: Arc<UridMap>,
    unmapped: Mutex<HashMap<u32, CString>>,
}

unsafe extern "C" fn urid_map(handle: *mut c_void, uri: *const c_char) -> u32 {
    let handle = &*(handle as *const UridHandle);
    str_arg(uri).map_or(0, |uri| handle.urids.map(uri))
}

unsafe extern "C" fn urid_unmap(handle: *mut c_void, urid: u32) -> *const c_char {
    let handle = &*(handle as *const UridHandle);
    let mut unmapped = handle.unmapped.lock();
    if let Some(text) = unmapped.get(&urid) {
        return text.as_ptr();
    }
    let Some(text) = handle.urids.unmap(urid).and_then(|uri| CString::new(uri).ok()) else {
        return ptr::null();
    };
    unmapped.entry(urid).or_insert(text).as_ptr()
}

unsafe extern "C" fn worker_schedule(handle: *mut c_void, size: u32, data: *const c_void) -> u32 {
    let schedule = &*(handle as *const WorkerSchedule);
    if data.is_null() {
        return status_to_raw(Lv2Status::Error);
    }
    let data = std::slice::from_raw_parts(data as *const u8, size as usize);
    status_to_raw(schedule.schedule(data))
}

unsafe extern "C" fn abstract_path(handle: *mut c_void, path: *const c_char) -> *mut c_char {
    let mapper = &*(handle as *const PathMapper);
    match str_arg(path) {
        Some(path) => path_to_raw(&mapper.abstract_path(Path::new(path))),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn absolute_path(handle: *mut c_void, path: *const c_char) -> *mut c_char {
    let mapper = &*(handle as *const PathMapper);
    match str_arg(path) {
        Some(path) => path_to_raw(&mapper.absolute_path(Path::new(path))),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn make_path(handle: *mut c_void, path: *const c_char) -> *mut c_char {
    let mapper = &*(handle as *const PathMapper);
    let Some(path) = str_arg(path) else {
        return ptr::null_mut();
    };
    match mapper.make_path(Path::new(path)) {
        Ok(made) => path_to_raw(&made),
        Err(err) => {
            tracing::error!("Could not create state path '{}': {}", path, err);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn free_path(_handle: *mut c_void, path: *mut c_char) {
    if !path.is_null() {
        drop(CString::from_raw(path));
    }
}

/// Path features handed to `instantiate` and to state calls.
struct PathFeatures {
    mapper: Box<PathMapper>,
    map: RawMapPath,
    make: RawMakePath,
    free: RawFreePath,
}

impl PathFeatures {
    fn new(mapper: PathMapper) -> Box<Self> {
        let mapper = Box::new(mapper);
        let handle = &*mapper as *const PathMapper as *mut c_void;
        Box::new(Self {
            map: RawMapPath {
                handle,
                abstract_path,
                absolute_path,
            },
            make: RawMakePath {
                handle,
                path: make_path,
            },
            free: RawFreePath {
                handle,
                free_path,
            },
            mapper,
        })
    }

    fn features(&self) -> [RawFeature; 3] {
        [
            RawFeature {
                uri: c_str(LV2_FEATURE_STATE_MAP_PATH).as_ptr(),
                data: &self.map as *const RawMapPath as *mut c_void,
            },
            RawFeature {
                uri: c_str(LV2_FEATURE_STATE_MAKE_PATH).as_ptr(),
                data: &self.make as *const RawMakePath as *mut c_void,
            },
            RawFeature {
                uri: c_str(LV2_FEATURE_STATE_FREE_PATH).as_ptr(),
                data: &self.free as *const RawFreePath as *mut c_void,
            },
        ]
    }
}

/// Static C strings for the feature URIs the host offers.
fn c_str(uri: &str) -> &'static CStr {
    match uri {
        LV2_FEATURE_URID_MAP => c"http://lv2plug.in/ns/ext/urid#map",
        LV2_FEATURE_URID_UNMAP => c"http://lv2plug.in/ns/ext/urid#unmap",
        LV2_FEATURE_OPTIONS => c"http://lv2plug.in/ns/ext/options#options",
        LV2_FEATURE_BOUNDED_BLOCK_LENGTH => c"http://lv2plug.in/ns/ext/buf-size#boundedBlockLength",
        LV2_FEATURE_FIXED_BLOCK_LENGTH => c"http://lv2plug.in/ns/ext/buf-size#fixedBlockLength",
        LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH => {
            c"http://lv2plug.in/ns/ext/buf-size#powerOf2BlockLength"
        }
        LV2_FEATURE_WORKER_SCHEDULE => c"http://lv2plug.in/ns/ext/worker#schedule",
        LV2_FEATURE_STATE_MAKE_PATH => c"http://lv2plug.in/ns/ext/state#makePath",
        LV2_FEATURE_STATE_MAP_PATH => c"http://lv2plug.in/ns/ext/state#mapPath",
        LV2_FEATURE_STATE_FREE_PATH => c"http://lv2plug.in/ns/ext/state#freePath",
        _ => c"",
    }
}

/// Host side data the plugin keeps pointers into. Boxed so addresses stay put.
struct HostData {
    urid_handle: Box<UridHandle>,
    urid_map: RawUridMap,
    urid_unmap: RawUridUnmap,
    schedule: Option<Box<WorkerSchedule>>,
    raw_schedule: Option<RawWorkerSchedule>,
    paths: Box<PathFeatures>,
    option_ints: [i32; 4],
    option_rate: f32,
    options: Vec<RawOption>,
    features: Vec<RawFeature>,
    feature_ptrs: Vec<*const RawFeature>,
}

impl HostData {
    fn new(features: &HostFeatures) -> Box<Self> {
        let urid_handle = Box::new(UridHandle {
            urids: Arc::clone(&features.urids),
            unmapped: Mutex::new(HashMap::new()),
        });
        let handle = &*urid_handle as *const UridHandle as *mut c_void;
        let schedule = features.worker.clone().map(Box::new);

        let mut data = Box::new(Self {
            urid_map: RawUridMap {
                handle,
                map: urid_map,
            },
            urid_unmap: RawUridUnmap {
                handle,
                unmap: urid_unmap,
            },
            raw_schedule: schedule.as_ref().map(|schedule| RawWorkerSchedule {
                handle: &**schedule as *const WorkerSchedule as *mut c_void,
                schedule_work: worker_schedule,
            }),
            schedule,
            urid_handle,
            paths: PathFeatures::new(features.paths.clone()),
            option_ints: [
                features.options.min_block_length as i32,
                features.options.max_block_length as i32,
                features.options.nominal_block_length as i32,
                features.options.sequence_size as i32,
            ],
            option_rate: features.options.sample_rate as f32,
            options: Vec::new(),
            features: Vec::new(),
            feature_ptrs: Vec::new(),
        });

        let int_keys = [
            URID_BUF_MIN_LENGTH,
            URID_BUF_MAX_LENGTH,
            URID_BUF_NOMINAL_LENGTH,
            URID_BUF_SEQUENCE_SIZE,
        ];
        let mut options: Vec<RawOption> = int_keys
            .iter()
            .zip(data.option_ints.iter())
            .map(|(&key, value)| RawOption {
                context: LV2_OPTIONS_INSTANCE,
                subject: 0,
                key,
                size: std::mem::size_of::<i32>() as u32,
                value_type: URID_ATOM_INT,
                value: value as *const i32 as *const c_void,
            })
            .collect();
        options.push(RawOption {
            context: LV2_OPTIONS_INSTANCE,
            subject: 0,
            key: URID_PARAM_SAMPLE_RATE,
            size: std::mem::size_of::<f32>() as u32,
            value_type: URID_ATOM_FLOAT,
            value: &data.option_rate as *const f32 as *const c_void,
        });
        options.push(RawOption::END);
        data.options = options;

        let mut list = vec![
            RawFeature {
                uri: c_str(LV2_FEATURE_URID_MAP).as_ptr(),
                data: &data.urid_map as *const RawUridMap as *mut c_void,
            },
            RawFeature {
                uri: c_str(LV2_FEATURE_URID_UNMAP).as_ptr(),
                data: &data.urid_unmap as *const RawUridUnmap as *mut c_void,
            },
            RawFeature {
                uri: c_str(LV2_FEATURE_OPTIONS).as_ptr(),
                data: data.options.as_ptr() as *mut c_void,
            },
            RawFeature {
                uri: c_str(LV2_FEATURE_BOUNDED_BLOCK_LENGTH).as_ptr(),
                data: ptr::null_mut(),
            },
        ];
        if features.fixed_block_length {
            list.push(RawFeature {
                uri: c_str(LV2_FEATURE_FIXED_BLOCK_LENGTH).as_ptr(),
                data: ptr::null_mut(),
            });
        }
        if features.power_of_two_block_length {
            list.push(RawFeature {
                uri: c_str(LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH).as_ptr(),
                data: ptr::null_mut(),
            });
        }
        if let Some(schedule) = data.raw_schedule.as_ref() {
            list.push(RawFeature {
                uri: c_str(LV2_FEATURE_WORKER_SCHEDULE).as_ptr(),
                data: schedule as *const RawWorkerSchedule as *mut c_void,
            });
        }
        list.extend(data.paths.features());
        data.features = list;
        data.feature_ptrs = data
            .features
            .iter()
            .map(|feature| feature as *const RawFeature)
            .chain(std::iter::once(ptr::null()))
            .collect();
        data
    }
}

/// Plugin descriptions from a scan cache plus the binaries opened so far.
pub struct NativeLv2World {
    catalog: Lv2Catalog,
    libraries: Mutex<HashMap<PathBuf, Arc<libloading::Library>>>,
}

impl NativeLv2World {
    pub fn new(catalog: Lv2Catalog) -> Self {
        Self {
            catalog,
            libraries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_cache(path: &Path) -> Result<Self> {
        Ok(Self::new(Lv2Catalog::load(path)?))
    }

    fn library(&self, path: &Path) -> Result<Arc<libloading::Library>> {
        let mut libraries = self.libraries.lock();
        if let Some(library) = libraries.get(path) {
            return Ok(Arc::clone(library));
        }
        let library = unsafe {
            libloading::Library::new(path).map_err(|e| PluginError::LoadFailed {
                path: path.to_path_buf(),
                stage: LoadStage::Opening,
                reason: format!("Failed to load library: {}", e),
            })?
        };
        let library = Arc::new(library);
        libraries.insert(path.to_path_buf(), Arc::clone(&library));
        Ok(library)
    }
}

impl super::descriptor::Lv2World for NativeLv2World {
    fn plugin_info(&self, uri: &str) -> Option<Lv2PluginInfo> {
        self.catalog.find(uri).cloned()
    }

    fn instantiate(
        &self,
        info: &Lv2PluginInfo,
        sample_rate: f64,
        features: &HostFeatures,
    ) -> Result<Box<dyn Lv2Instance>> {
        let path = PathBuf::from(&info.binary);
        let load_error = |stage: LoadStage, reason: String| PluginError::LoadFailed {
            path: path.clone(),
            stage,
            reason,
        };
        let library = self.library(&path)?;

        let entry: libloading::Symbol<DescriptorFn> = unsafe {
            library
                .get(b"lv2_descriptor\0")
                .map_err(|e| load_error(LoadStage::Opening, format!("No lv2_descriptor symbol: {}", e)))?
        };

        let mut descriptor = ptr::null();
        for index in 0.. {
            let candidate = unsafe { entry(index) };
            if candidate.is_null() {
                break;
            }
            let uri = unsafe { str_arg((*candidate).uri) };
            if uri == Some(info.uri.as_str()) {
                descriptor = candidate;
                break;
            }
        }
        drop(entry);
        if descriptor.is_null() {
            return Err(load_error(
                LoadStage::Factory,
                format!("Binary does not provide '{}'", info.uri),
            ));
        }
        let raw = unsafe { &*descriptor };
        let (Some(instantiate), Some(connect_port), Some(run)) =
            (raw.instantiate, raw.connect_port, raw.run)
        else {
            return Err(load_error(
                LoadStage::Factory,
                "Descriptor is missing required functions".to_string(),
            ));
        };

        let host = HostData::new(features);
        let mut bundle = info.bundle.clone();
        if !bundle.ends_with('/') {
            bundle.push('/');
        }
        let bundle = CString::new(bundle)
            .map_err(|_| load_error(LoadStage::Instantiation, "Invalid bundle path".to_string()))?;

        let handle = unsafe { instantiate(descriptor, sample_rate, bundle.as_ptr(), host.feature_ptrs.as_ptr()) };
        if handle.is_null() {
            return Err(load_error(
                LoadStage::Instantiation,
                "Plugin failed to initialize".to_string(),
            ));
        }

        let extension = |uri: &CStr| -> *const c_void {
            raw.extension_data
                .map_or(ptr::null(), |extension_data| unsafe { extension_data(uri.as_ptr()) })
        };
        let worker = extension(LV2_WORKER_INTERFACE) as *const RawWorkerInterface;
        let state = extension(LV2_STATE_INTERFACE) as *const RawStateInterface;
        let programs = extension(LV2_PROGRAMS_INTERFACE) as *const RawProgramsInterface;
        let options = extension(LV2_OPTIONS_INTERFACE) as *const RawOptionsInterface;

        tracing::debug!("Instantiated native LV2 plugin '{}'", info.uri);
        Ok(Box::new(NativeLv2Instance {
            descriptor,
            handle,
            connect_port,
            run,
            connected: vec![ptr::null_mut(); info.ports.len()],
            worker,
            worker_taken: false,
            state,
            programs,
            options,
            host,
            _library: library,
        }))
    }
}

/// One native plugin handle.
pub struct NativeLv2Instance {
    descriptor: *const RawDescriptor,
    handle: *mut c_void,
    connect_port: unsafe extern "C" fn(*mut c_void, u32, *mut c_void),
    run: unsafe extern "C" fn(*mut c_void, u32),
    connected: Vec<*mut c_void>,
    worker: *const RawWorkerInterface,
    worker_taken: bool,
    state: *const RawStateInterface,
    programs: *const RawProgramsInterface,
    options: *const RawOptionsInterface,
    host: Box<HostData>,
    _library: Arc<libloading::Library>,
}

// The handle is only driven by whoever holds `&mut self`; the worker interface
// is thread-safe per the LV2 worker contract.
unsafe impl Send for NativeLv2Instance {}

impl NativeLv2Instance {
    fn descriptor(&self) -> &RawDescriptor {
        unsafe { &*self.descriptor }
    }
}

impl Lv2Instance for NativeLv2Instance {
    fn activate(&mut self) {
        if let Some(activate) = self.descriptor().activate {
            unsafe { activate(self.handle) };
        }
    }

    fn deactivate(&mut self) {
        if let Some(deactivate) = self.descriptor().deactivate {
            unsafe { deactivate(self.handle) };
        }
    }

    fn run(&mut self, ports: &mut dyn PortBuffers, frames: u32) {
        for (index, connected) in self.connected.iter_mut().enumerate() {
            let port = ports.port_ptr(index as u32);
            if *connected != port {
                unsafe { (self.connect_port)(self.handle, index as u32, port) };
                *connected = port;
            }
        }
        unsafe { (self.run)(self.handle, frames) };
    }

    fn take_worker(&mut self) -> Option<Box<dyn Lv2Worker>> {
        if self.worker.is_null() || self.worker_taken {
            return None;
        }
        self.worker_taken = true;
        Some(Box::new(NativeWorker {
            handle: self.handle,
            interface: self.worker,
        }))
    }

    fn work_response(&mut self, data: &[u8]) {
        if self.worker.is_null() {
            return;
        }
        unsafe {
            ((*self.worker).work_response)(
                self.handle,
                data.len() as u32,
                data.as_ptr() as *const c_void,
            )
        };
    }

    fn end_run(&mut self) {
        if self.worker.is_null() {
            return;
        }
        if let Some(end_run) = unsafe { (*self.worker).end_run } {
            unsafe { end_run(self.handle) };
        }
    }

    fn state(&mut self) -> Option<&mut dyn Lv2StateInterface> {
        if self.state.is_null() {
            None
        } else {
            Some(self)
        }
    }

    fn programs(&mut self) -> Option<&mut dyn Lv2ProgramsInterface> {
        if self.programs.is_null() {
            None
        } else {
            Some(self)
        }
    }

    fn options(&mut self) -> Option<&mut dyn Lv2OptionsInterface> {
        if self.options.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl Drop for NativeLv2Instance {
    fn drop(&mut self) {
        if let Some(cleanup) = self.descriptor().cleanup {
            unsafe { cleanup(self.handle) };
        }
        self.handle = ptr::null_mut();
    }
}

type StoreClosure<'a> = &'a mut dyn FnMut(u32, &[u8], u32) -> bool;

unsafe extern "C" fn state_store(
    handle: *mut c_void,
    key: u32,
    value: *const c_void,
    size: usize,
    value_type: u32,
    _flags: u32,
) -> u32 {
    let store = &mut *(handle as *mut StoreClosure<'_>);
    let value = if value.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(value as *const u8, size)
    };
    if store(key, value, value_type) {
        0
    } else {
        1
    }
}

struct RetrieveContext<'a> {
    retrieve: &'a dyn Fn(u32) -> Option<(Vec<u8>, u32)>,
    values: Vec<Vec<u8>>,
}

unsafe extern "C" fn state_retrieve(
    handle: *mut c_void,
    key: u32,
    size: *mut usize,
    value_type: *mut u32,
    flags: *mut u32,
) -> *const c_void {
    let context = &mut *(handle as *mut RetrieveContext<'_>);
    let Some((value, kind)) = (context.retrieve)(key) else {
        return ptr::null();
    };
    if !size.is_null() {
        *size = value.len();
    }
    if !value_type.is_null() {
        *value_type = kind;
    }
    if !flags.is_null() {
        // POD | PORTABLE
        *flags = 1 | 2;
    }
    context.values.push(value);
    context
        .values
        .last()
        .map_or(ptr::null(), |value| value.as_ptr() as *const c_void)
}

impl NativeLv2Instance {
    fn state_features(paths: &PathMapper) -> (Box<PathFeatures>, [RawFeature; 3]) {
        let features = PathFeatures::new(paths.clone());
        let raw = features.features();
        (features, raw)
    }
}

impl Lv2StateInterface for NativeLv2Instance {
    fn save(
        &mut self,
        store: &mut dyn FnMut(u32, &[u8], u32) -> bool,
        paths: &PathMapper,
    ) -> Lv2Status {
        let (_keep, raw) = Self::state_features(paths);
        let pointers: [*const RawFeature; 4] = [&raw[0], &raw[1], &raw[2], ptr::null()];
        let mut store: StoreClosure<'_> = store;
        let status = unsafe {
            ((*self.state).save)(
                self.handle,
                state_store,
                &mut store as *mut StoreClosure<'_> as *mut c_void,
                1 | 2,
                pointers.as_ptr(),
            )
        };
        status_from_raw(status)
    }

    fn restore(
        &mut self,
        retrieve: &dyn Fn(u32) -> Option<(Vec<u8>, u32)>,
        paths: &PathMapper,
    ) -> Lv2Status {
        let (_keep, raw) = Self::state_features(paths);
        let pointers: [*const RawFeature; 4] = [&raw[0], &raw[1], &raw[2], ptr::null()];
        let mut context = RetrieveContext {
            retrieve,
            values: Vec::new(),
        };
        let status = unsafe {
            ((*self.state).restore)(
                self.handle,
                state_retrieve,
                &mut context as *mut RetrieveContext<'_> as *mut c_void,
                0,
                pointers.as_ptr(),
            )
        };
        status_from_raw(status)
    }
}

impl Lv2ProgramsInterface for NativeLv2Instance {
    fn program(&self, index: u32) -> Option<(u32, u32, String)> {
        let descriptor = unsafe { ((*self.programs).get_program)(self.handle, index) };
        if descriptor.is_null() {
            return None;
        }
        let descriptor = unsafe { &*descriptor };
        let name = unsafe { str_arg(descriptor.name) }.unwrap_or_default();
        Some((descriptor.bank, descriptor.program, name.to_string()))
    }

    fn select_program(&mut self, bank: u32, program: u32) {
        unsafe { ((*self.programs).select_program)(self.handle, bank, program) };
    }
}

impl Lv2OptionsInterface for NativeLv2Instance {
    fn set(&mut self, options: &[(u32, Lv2OptionValue)]) -> Lv2Status {
        let values: Vec<Lv2OptionValue> = options.iter().map(|(_, value)| *value).collect();
        let mut raw: Vec<RawOption> = options
            .iter()
            .zip(values.iter())
            .map(|((key, _), value)| {
                let (value_type, value) = match value {
                    Lv2OptionValue::Int(v) => (URID_ATOM_INT, v as *const i32 as *const c_void),
                    Lv2OptionValue::Float(v) => (URID_ATOM_FLOAT, v as *const f32 as *const c_void),
                };
                RawOption {
                    context: LV2_OPTIONS_INSTANCE,
                    subject: 0,
                    key: *key,
                    size: 4,
                    value_type,
                    value,
                }
            })
            .collect();
        raw.push(RawOption::END);
        let status = unsafe { ((*self.options).set)(self.handle, raw.as_ptr()) };
        status_from_raw(status)
    }
}

/// Worker side of a native plugin.
struct NativeWorker {
    handle: *mut c_void,
    interface: *const RawWorkerInterface,
}

unsafe impl Send for NativeWorker {}

type RespondClosure<'a> = &'a mut dyn FnMut(&[u8]) -> bool;

unsafe extern "C" fn worker_respond(handle: *mut c_void, size: u32, data: *const c_void) -> u32 {
    let respond = &mut *(handle as *mut RespondClosure<'_>);
    if data.is_null() {
        return status_to_raw(Lv2Status::Error);
    }
    let data = std::slice::from_raw_parts(data as *const u8, size as usize);
    if respond(data) {
        status_to_raw(Lv2Status::Success)
    } else {
        status_to_raw(Lv2Status::NoSpace)
    }
}

impl Lv2Worker for NativeWorker {
    fn work(&mut self, respond: &mut dyn FnMut(&[u8]) -> bool, data: &[u8]) -> Lv2Status {
        let mut respond: RespondClosure<'_> = respond;
        let status = unsafe {
            ((*self.interface).work)(
                self.handle,
                worker_respond,
                &mut respond as *mut RespondClosure<'_> as *mut c_void,
                data.len() as u32,
                data.as_ptr() as *const c_void,
            )
        };
        status_from_raw(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lv2::descriptor::HostOptions;
    use crate::plugin::ProjectFolder;

    fn host_features(fixed: bool) -> HostFeatures {
        HostFeatures {
            urids: Arc::new(UridMap::new()),
            options: HostOptions {
                min_block_length: 0,
                max_block_length: 512,
                nominal_block_length: 512,
                sequence_size: 8192,
                sample_rate: 48000.0,
            },
            worker: None,
            paths: PathMapper::new(ProjectFolder::default(), "Native"),
            fixed_block_length: fixed,
            power_of_two_block_length: false,
        }
    }

    #[test]
    fn test_host_feature_list_is_null_terminated() {
        let host = HostData::new(&host_features(true));
        assert_eq!(host.feature_ptrs.last().copied(), Some(ptr::null()));
        // map, unmap, options, bounded, fixed, three path features
        assert_eq!(host.features.len(), 8);
        assert_eq!(host.options.len(), 6);
        assert_eq!(host.options[4].key, URID_PARAM_SAMPLE_RATE);
    }

    #[test]
    fn test_urid_callbacks() {
        let host = HostData::new(&host_features(false));
        let uri = c"urn:cadenza:test#thing";
        let urid = unsafe { (host.urid_map.map)(host.urid_map.handle, uri.as_ptr()) };
        assert!(urid > 0);
        let back = unsafe { (host.urid_unmap.unmap)(host.urid_unmap.handle, urid) };
        assert_eq!(unsafe { CStr::from_ptr(back) }, uri);
        let missing = unsafe { (host.urid_unmap.unmap)(host.urid_unmap.handle, 100_000) };
        assert!(missing.is_null());
    }

    #[test]
    fn test_missing_binary_fails_to_open() {
        let mut info = Lv2PluginInfo::new("urn:cadenza:missing", "Missing");
        info.binary = "/nonexistent/missing.so".to_string();
        let world = NativeLv2World::new(Lv2Catalog {
            plugins: vec![info.clone()],
        });
        use crate::lv2::descriptor::Lv2World;
        assert!(world.plugin_info("urn:cadenza:missing").is_some());
        let err = world
            .instantiate(&info, 48000.0, &host_features(false))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PluginError::LoadFailed {
                stage: LoadStage::Opening,
                ..
            }
        ));
    }
}
