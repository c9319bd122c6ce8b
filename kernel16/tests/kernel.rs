use hex_literal::hex;
use kernel16::{
    config::KernelConfig,
    cpu::{Cpu16, MicroCpu},
    global::handle_to_sel,
    kernel::LoadParams,
    loader::MemoryResolver,
    ne::{
        reloc::{RelocRecord, ADDR_POINTER32},
        resource::ResId,
        NeBuilder,
    },
    thunk::decode_thunk,
    Kernel, KernelError,
};

const KERNEL_INIT_TASK: u16 = 91;
const KERNEL_WAIT_EVENT: u16 = 30;
const KERNEL_GET_VERSION: u16 = 3;

fn kernel_with(resolver: MemoryResolver) -> Kernel {
    Kernel::with(
        KernelConfig::default(),
        Box::new(resolver),
        Box::new(|| Box::new(MicroCpu::default()) as Box<dyn Cpu16>),
    )
    .unwrap()
}

/// LIB.DLL: LibMain returns 1, ANSWER returns 42, WEP takes one word.
fn library() -> Vec<u8> {
    let mut b = NeBuilder::new("LIB");
    b.lib(true);
    let code = b.code_segment(hex!("b8 01 00 cb  b8 2a 00 cb  b8 01 00 ca 02 00").to_vec());
    b.data_segment(vec![0; 0x10], 0x100);
    b.entry(code, 0);
    b.export("Answer", 1, code, 4).export("WEP", 2, code, 8);
    b.resource(ResId::Int(10), ResId::Name("DATA".into()), b"payload".to_vec());
    b.build()
}

/// HELLO.EXE: InitTask, two WaitEvent(0) calls, exit code 7.
fn program() -> Vec<u8> {
    let mut b = NeBuilder::new("HELLO");
    let kernel = b.import_module("KERNEL");
    let code = b.code_segment(
        hex!(
            "9a ff ff 00 00
             6a 00 9a ff ff 00 00
             6a 00 9a ff ff 00 00
             b8 07 00 cb"
        )
        .to_vec(),
    );
    let data = b.data_segment(vec![0; 0x10], 0x100);
    b.entry(code, 0).stack(data, 0x400);
    b.reloc(code, RelocRecord::import_ordinal(ADDR_POINTER32, 1, kernel, KERNEL_INIT_TASK))
        .reloc(code, RelocRecord::import_ordinal(ADDR_POINTER32, 8, kernel, KERNEL_WAIT_EVENT))
        .reloc(code, RelocRecord::import_ordinal(ADDR_POINTER32, 15, kernel, KERNEL_WAIT_EVENT));
    b.build()
}

/// APP.EXE: imports LIB and KERNEL.
fn client() -> Vec<u8> {
    let mut b = NeBuilder::new("APP");
    let lib = b.import_module("LIB");
    let kernel = b.import_module("KERNEL");
    // 0: mov ds, ax; xor ax, ax; mov ax, ds; retf
    // 7: call far LIB.1; retf
    // d: call far KERNEL.GetVersion; retf
    let code = b.code_segment(
        hex!(
            "8e d8 31 c0 8c d8 cb
             9a ff ff 00 00 cb
             9a ff ff 00 00 cb"
        )
        .to_vec(),
    );
    b.data_segment(vec![0; 0x10], 0x100);
    b.export("ShowDs", 1, code, 0)
        .export("CallLib", 2, code, 7)
        .export("Version", 3, code, 0xd);
    b.reloc(code, RelocRecord::import_ordinal(ADDR_POINTER32, 8, lib, 1))
        .reloc(code, RelocRecord::import_ordinal(ADDR_POINTER32, 0xe, kernel, KERNEL_GET_VERSION));
    b.build()
}

#[test]
fn test_load_library() {
    let kernel = kernel_with(MemoryResolver::new().with("LIB.DLL", library()));
    let instance = kernel.load_library("lib.dll").unwrap();
    let hmodule = kernel.get_module_handle("LIB");
    assert_ne!(hmodule, 0);
    assert_eq!(kernel.get_exe_ptr(instance), hmodule);
    assert_eq!(kernel.get_instance(hmodule), instance);
    assert_eq!(kernel.get_module_usage(hmodule), 1);
    assert_eq!(kernel.get_module_name(hmodule).unwrap(), "LIB");

    let answer = kernel.get_proc_address(hmodule, "answer");
    assert_ne!(answer, 0);
    assert_eq!(kernel.get_proc_address(hmodule, "#1"), answer);
    assert_eq!(kernel.get_proc_address_ordinal(hmodule, 1), answer);
    assert_eq!(kernel.call_to_16(answer, &[]).unwrap() & 0xffff, 42);
    assert_eq!(kernel.get_proc_address(hmodule, "Missing"), 0);

    // a second load only counts
    assert_eq!(kernel.load_library("LIB.DLL").unwrap(), instance);
    assert_eq!(kernel.get_module_usage(hmodule), 2);
    assert!(kernel.free_module(hmodule));
    assert_eq!(kernel.get_module_usage(hmodule), 1);
    kernel.free_library(hmodule);
    assert_eq!(kernel.get_module_handle("LIB"), 0);
    assert!(kernel.modules().iter().all(|m| m.name != "LIB"));
}

#[test]
fn test_missing_module() {
    let kernel = kernel_with(MemoryResolver::new());
    let err = kernel.load_library("NOPE.DLL").unwrap_err();
    assert!(matches!(err, KernelError::ModuleNotFound(_)));
    assert!(err.legacy_code() < 32);
    assert_eq!(kernel.modules().len(), 1);
}

#[test]
fn test_imports_and_thunks() {
    let resolver = MemoryResolver::new()
        .with("LIB.DLL", library())
        .with("APP.EXE", client());
    let kernel = kernel_with(resolver);
    let instance = kernel.load_module("APP.EXE", None).unwrap();
    let app = kernel.get_exe_ptr(instance);
    let lib = kernel.get_module_handle("LIB");
    assert_ne!(lib, 0);

    let info = kernel.module_info(app).unwrap();
    assert_eq!(info.imports, vec![lib, kernel.kernel_module()]);

    let call_lib = kernel.get_proc_address(app, "CALLLIB");
    assert_eq!(kernel.call_to_16(call_lib, &[]).unwrap() & 0xffff, 42);
    let version = kernel.get_proc_address(app, "VERSION");
    assert_eq!(kernel.call_to_16(version, &[]).unwrap() & 0xffff, 0x0a03);

    // programs get a thunk loading their data segment, libraries do not
    let show_ds = kernel.get_proc_address(app, "SHOWDS");
    let thunk = kernel.make_proc_instance(show_ds, instance).unwrap();
    assert_ne!(thunk, show_ds);
    let decoded = kernel.with_state(|st| decode_thunk(&st.heap, thunk));
    assert_eq!(decoded, Some((handle_to_sel(instance), show_ds)));
    assert_eq!(
        kernel.call_to_16(thunk, &[]).unwrap() & 0xffff,
        handle_to_sel(instance) as u32
    );
    kernel.free_proc_instance(thunk);

    let answer = kernel.get_proc_address(lib, "ANSWER");
    let lib_instance = kernel.get_instance(lib);
    assert_eq!(kernel.make_proc_instance(answer, lib_instance).unwrap(), answer);
    assert_eq!(kernel.make_proc_instance(0, instance).unwrap(), 0);

    // LIB was loaded for APP alone and goes with it
    assert_eq!(kernel.get_module_usage(lib), 1);
    assert!(kernel.free_module(app));
    assert_eq!(kernel.get_module_handle("LIB"), 0);
    assert_eq!(kernel.get_module_handle("APP"), 0);
}

/// BROKEN.DLL: imports LIB, then a module nobody provides.
fn broken() -> Vec<u8> {
    let mut b = NeBuilder::new("BROKEN");
    b.lib(true);
    b.import_module("LIB");
    b.import_module("MISSING");
    let code = b.code_segment(hex!("b8 01 00 cb").to_vec());
    b.entry(code, 0);
    b.build()
}

#[test]
fn test_failed_import_releases_dependencies() {
    let resolver = MemoryResolver::new()
        .with("LIB.DLL", library())
        .with("BROKEN.DLL", broken());
    let kernel = kernel_with(resolver);
    let baseline = kernel.modules().len();

    // LIB was loaded for BROKEN alone
    assert!(kernel.load_library("BROKEN.DLL").is_err());
    assert_eq!(kernel.get_module_handle("BROKEN"), 0);
    assert_eq!(kernel.get_module_handle("LIB"), 0);
    assert_eq!(kernel.modules().len(), baseline);

    // an already loaded LIB keeps its own reference
    kernel.load_library("LIB.DLL").unwrap();
    let lib = kernel.get_module_handle("LIB");
    assert_eq!(kernel.get_module_usage(lib), 1);
    assert!(kernel.load_library("BROKEN.DLL").is_err());
    assert_eq!(kernel.get_module_usage(lib), 1);
    kernel.free_library(lib);
    assert_eq!(kernel.get_module_handle("LIB"), 0);
}

#[test]
fn test_resources() {
    let kernel = kernel_with(MemoryResolver::new().with("LIB.DLL", library()));
    let instance = kernel.load_library("LIB.DLL").unwrap();
    let hrsrc = kernel.find_resource(instance, &ResId::Int(10), &ResId::from("DATA"));
    assert_ne!(hrsrc, 0);
    assert_eq!(kernel.find_resource(instance, &ResId::Int(10), &ResId::Int(99)), 0);
    assert!(kernel.sizeof_resource(instance, hrsrc) >= 7);

    let hmem = kernel.load_resource(instance, hrsrc);
    assert_ne!(hmem, 0);
    let ptr = kernel.global_lock(hmem);
    assert_eq!(kernel.read_bytes(ptr, 7).unwrap(), b"payload");
    kernel.global_unlock(hmem);

    // loaded once, shared after
    assert_eq!(kernel.load_resource(instance, hrsrc), hmem);
    assert_eq!(kernel.free_resource(hmem), 0);
    assert_eq!(kernel.free_resource(hmem), 0);
    assert_eq!(kernel.load_resource(instance, 0), 0);
}

#[test]
fn test_task_runs_to_exit() {
    let kernel = kernel_with(MemoryResolver::new().with("HELLO.EXE", program()));
    let instance = kernel
        .load_module("HELLO.EXE", Some(&LoadParams::default()))
        .unwrap();
    assert!(instance >= 32);
    let task = kernel
        .tasks()
        .into_iter()
        .find(|t| t.instance == instance)
        .unwrap();
    assert_eq!(task.name, "HELLO");
    assert!(kernel.is_task(task.handle));

    kernel.post_event(task.handle);
    assert_eq!(kernel.join_task(task.handle), Some(7));
    assert!(!kernel.is_task(task.handle));
    assert_eq!(kernel.get_module_handle("HELLO"), 0);
    assert!(kernel.is_shut_down());
    assert_eq!(kernel.syslevel_violations(), 0);
}

#[test]
fn test_local_heap_and_atoms() {
    let kernel = kernel_with(MemoryResolver::new());
    let h = kernel.global_alloc(
        kernel16::global::GlobalFlags::MOVEABLE | kernel16::global::GlobalFlags::ZEROINIT,
        0x2000,
    );
    assert_ne!(h, 0);
    let ds = handle_to_sel(h);
    assert!(kernel.local_init(ds, 0, 0x1fff));
    assert!(kernel.local_validate(ds));

    assert!(kernel.init_atom_table(ds, 0));
    let a = kernel.add_atom(ds, "Hello");
    assert!(a >= 0xc000);
    assert_eq!(kernel.add_atom(ds, "HELLO"), a);
    assert_eq!(kernel.find_atom(ds, "hello"), a);
    assert_eq!(kernel.get_atom_name(ds, a, 64).unwrap(), "Hello");
    assert_eq!(kernel.add_atom(ds, "#123"), 123);

    assert_eq!(kernel.delete_atom(ds, a), 0);
    assert_eq!(kernel.delete_atom(ds, a), 0);
    assert_eq!(kernel.find_atom(ds, "Hello"), 0);
    assert!(kernel.local_validate(ds));
}
