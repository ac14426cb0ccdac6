//! End-to-end evaluation against stubbed target collaborators.

use std::collections::HashMap;

use marlin_dwarf::{EvalContext, EvalError, Expression, Value};
use marlin_target::{
    Frame, ModuleHandle, ModuleId, ModuleRegistry, Process, RegisterContext, RegisterKind,
    RunTimeEndian, Scalar, TargetError, Thread,
};

struct StubProcess {
    base: u64,
    memory: Vec<u8>,
    endian: RunTimeEndian,
    address_size: u8,
}

impl StubProcess {
    fn little(base: u64, memory: Vec<u8>) -> Self {
        StubProcess {
            base,
            memory,
            endian: RunTimeEndian::Little,
            address_size: 8,
        }
    }
}

impl Process for StubProcess {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        addr.checked_sub(self.base)
            .map(|off| off as usize)
            .and_then(|off| self.memory.get(off..off + len))
            .map(|bytes| bytes.to_vec())
            .ok_or(TargetError::MemoryRead {
                addr,
                size: len,
                reason: "address out of mapped range".into(),
            })
    }

    fn byte_order(&self) -> RunTimeEndian {
        self.endian
    }

    fn address_size(&self) -> u8 {
        self.address_size
    }
}

#[derive(Default)]
struct StubRegisters {
    values: HashMap<u32, u64>,
    non_scalar: Vec<u32>,
    pc: Option<u64>,
}

impl RegisterContext for StubRegisters {
    fn convert_to_native(&self, _kind: RegisterKind, num: u32) -> Option<u32> {
        if self.values.contains_key(&num) || self.non_scalar.contains(&num) {
            Some(num)
        } else {
            None
        }
    }

    fn read_register(&self, native: u32) -> Result<Scalar, TargetError> {
        if self.non_scalar.contains(&native) {
            return Err(TargetError::RegisterNotScalar { native });
        }
        self.values
            .get(&native)
            .map(|&v| Scalar::from(v))
            .ok_or(TargetError::RegisterUnavailable { native })
    }

    fn program_counter(&self) -> Option<u64> {
        self.pc
    }
}

struct StubFrame {
    frame_base: Option<u64>,
    cfa: Option<u64>,
    registers: Option<StubRegisters>,
}

impl Frame for StubFrame {
    fn frame_base(&self) -> Result<Scalar, TargetError> {
        self.frame_base
            .map(Scalar::from)
            .ok_or(TargetError::FrameBase {
                reason: "no frame base expression".into(),
            })
    }

    fn cfa(&self) -> Option<u64> {
        self.cfa
    }

    fn register_context(&self) -> Option<&dyn RegisterContext> {
        self.registers.as_ref().map(|r| r as &dyn RegisterContext)
    }
}

struct StubThread {
    tls_base: Option<u64>,
}

impl Thread for StubThread {
    fn thread_local_base(&self, _module: ModuleId) -> Option<u64> {
        self.tls_base
    }
}

fn expression(bytes: &[u8]) -> Expression {
    Expression::new(
        bytes.to_vec(),
        RunTimeEndian::Little,
        8,
        RegisterKind::Dwarf,
        None,
    )
}

fn registers(pairs: &[(u32, u64)]) -> StubRegisters {
    StubRegisters {
        values: pairs.iter().copied().collect(),
        ..StubRegisters::default()
    }
}

#[test]
fn literal_arithmetic() {
    // lit1, lit2, plus
    let result = expression(&[0x31, 0x32, 0x22])
        .evaluate(&EvalContext::default(), None, None)
        .unwrap();
    assert_eq!(result.as_scalar().unwrap().as_u64(), 3);
}

#[test]
fn register_then_frame_base_offset() {
    // reg1, fbreg +4: two independent pushes, the result is the top
    let regs = registers(&[(1, 0x1000)]);
    let frame = StubFrame {
        frame_base: Some(0x2000),
        cfa: None,
        registers: None,
    };
    let ctx = EvalContext {
        registers: Some(&regs),
        frame: Some(&frame),
        ..EvalContext::default()
    };
    let result = expression(&[0x51, 0x91, 0x04])
        .evaluate(&ctx, None, None)
        .unwrap();
    assert_eq!(result, Value::LoadAddress(0x2004));
}

#[test]
fn deref_of_file_address_is_permissive() {
    // addr 0x1000, deref: a file address is not readable and passes
    // through unchanged even with a process attached
    let process = StubProcess::little(0x1000, 0xdead_u64.to_le_bytes().to_vec());
    let ctx = EvalContext {
        process: Some(&process),
        ..EvalContext::default()
    };
    let mut bytes = vec![0x03];
    bytes.extend_from_slice(&0x1000u64.to_le_bytes());
    bytes.push(0x06);
    let result = expression(&bytes).evaluate(&ctx, None, None).unwrap();
    assert_eq!(result, Value::FileAddress(0x1000));
}

#[test]
fn deref_of_load_address_reads_the_process() {
    // breg2 +0, deref with the pointer 0xdead stored at 0x1000
    let process = StubProcess::little(0x1000, 0xdead_u64.to_le_bytes().to_vec());
    let regs = registers(&[(2, 0x1000)]);
    let ctx = EvalContext {
        process: Some(&process),
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let result = expression(&[0x72, 0x00, 0x06])
        .evaluate(&ctx, None, None)
        .unwrap();
    assert_eq!(result, Value::Scalar(Scalar::from(0xdeadu64)));
}

#[test]
fn deref_size_zero_extends_past_the_address_width() {
    // an 8-byte deref_size on a 4-byte-address target still works
    let process = StubProcess {
        base: 0x1000,
        memory: 0xfeed_face_cafe_f00d_u64.to_le_bytes().to_vec(),
        endian: RunTimeEndian::Little,
        address_size: 4,
    };
    let regs = registers(&[(2, 0x1000)]);
    let ctx = EvalContext {
        process: Some(&process),
        registers: Some(&regs),
        ..EvalContext::default()
    };
    // breg2 +0, deref_size 8
    let expr = Expression::new(
        vec![0x72, 0x00, 0x94, 0x08],
        RunTimeEndian::Little,
        4,
        RegisterKind::Dwarf,
        None,
    );
    let result = expr.evaluate(&ctx, None, None).unwrap();
    assert_eq!(
        result,
        Value::Scalar(Scalar::from(0xfeed_face_cafe_f00d_u64))
    );

    // and a 2-byte read masks down
    let expr = Expression::new(
        vec![0x72, 0x00, 0x94, 0x02],
        RunTimeEndian::Little,
        4,
        RegisterKind::Dwarf,
        None,
    );
    let result = expr.evaluate(&ctx, None, None).unwrap();
    assert_eq!(result, Value::Scalar(Scalar::from(0xf00du64)));
}

#[test]
fn failed_memory_read_is_a_typed_error() {
    let process = StubProcess::little(0x1000, vec![0; 8]);
    let regs = registers(&[(2, 0x9000)]);
    let ctx = EvalContext {
        process: Some(&process),
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let err = expression(&[0x72, 0x00, 0x06])
        .evaluate(&ctx, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        EvalError::Memory {
            addr: 0x9000,
            ..
        }
    ));
}

#[test]
fn location_list_selects_by_pc() {
    // one covering entry (0x100, 0x200) -> lit0, then the terminator
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x100u64.to_le_bytes());
    bytes.extend_from_slice(&0x200u64.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.push(0x30);
    bytes.extend_from_slice(&[0u8; 16]);

    let expr = Expression::new(
        bytes,
        RunTimeEndian::Little,
        8,
        RegisterKind::Dwarf,
        Some(0),
    );
    assert!(expr.is_location_list());

    let regs = StubRegisters {
        pc: Some(0x150),
        ..StubRegisters::default()
    };
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let result = expr.evaluate(&ctx, None, Some(0)).unwrap();
    assert_eq!(result.as_scalar().unwrap().as_u64(), 0);

    // find_range and location_list_contains agree
    assert!(expr.location_list_contains(0, 0x150));
    assert_eq!(expr.find_range(0, 0x150).unwrap().map(|(_, len)| len), Some(1));
    assert!(!expr.location_list_contains(0, 0x250));
    assert!(expr.find_range(0, 0x250).unwrap().is_none());
}

#[test]
fn location_list_miss_reports_no_location() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x100u64.to_le_bytes());
    bytes.extend_from_slice(&0x200u64.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.push(0x30);
    bytes.extend_from_slice(&[0u8; 16]);

    let expr = Expression::new(
        bytes,
        RunTimeEndian::Little,
        8,
        RegisterKind::Dwarf,
        Some(0),
    );

    // pc outside every entry
    let regs = StubRegisters {
        pc: Some(0x2000),
        ..StubRegisters::default()
    };
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };
    assert!(matches!(
        expr.evaluate(&ctx, None, Some(0)),
        Err(EvalError::NoLocation)
    ));

    // unknown pc
    let no_pc = StubRegisters::default();
    let ctx = EvalContext {
        registers: Some(&no_pc),
        ..EvalContext::default()
    };
    assert!(matches!(
        expr.evaluate(&ctx, None, Some(0)),
        Err(EvalError::NoLocation)
    ));

    // missing list base
    let regs = StubRegisters {
        pc: Some(0x150),
        ..StubRegisters::default()
    };
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };
    assert!(matches!(
        expr.evaluate(&ctx, None, None),
        Err(EvalError::NoLocation)
    ));
}

#[test]
fn location_list_pc_falls_back_to_the_frame() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x100u64.to_le_bytes());
    bytes.extend_from_slice(&0x200u64.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.push(0x31);
    bytes.extend_from_slice(&[0u8; 16]);

    let expr = Expression::new(
        bytes,
        RunTimeEndian::Little,
        8,
        RegisterKind::Dwarf,
        Some(0),
    );

    let frame = StubFrame {
        frame_base: None,
        cfa: None,
        registers: Some(StubRegisters {
            pc: Some(0x180),
            ..StubRegisters::default()
        }),
    };
    let ctx = EvalContext {
        frame: Some(&frame),
        ..EvalContext::default()
    };
    let result = expr.evaluate(&ctx, None, Some(0)).unwrap();
    assert_eq!(result.as_scalar().unwrap().as_u64(), 1);
}

#[test]
fn division_by_zero() {
    // lit1, lit0, div
    assert!(matches!(
        expression(&[0x31, 0x30, 0x1b]).evaluate(&EvalContext::default(), None, None),
        Err(EvalError::DivisionByZero { .. })
    ));
}

#[test]
fn piece_assembly_from_scalars() {
    // const2u 0xabcd, piece 1, const1u 0x12, piece 1
    let result = expression(&[0x0a, 0xcd, 0xab, 0x93, 0x01, 0x08, 0x12, 0x93, 0x01])
        .evaluate(&EvalContext::default(), None, None)
        .unwrap();
    assert_eq!(result, Value::Bytes(vec![0xcd, 0x12]));
}

#[test]
fn piece_assembly_from_memory_and_register() {
    // breg2 +0, piece 2, reg3, piece 2: two bytes of memory then the low
    // two bytes of a register
    let process = StubProcess::little(0x1000, vec![0x11, 0x22]);
    let regs = registers(&[(2, 0x1000), (3, 0xccdd)]);
    let ctx = EvalContext {
        process: Some(&process),
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let result = expression(&[0x72, 0x00, 0x93, 0x02, 0x53, 0x93, 0x02])
        .evaluate(&ctx, None, None)
        .unwrap();
    assert_eq!(result, Value::Bytes(vec![0x11, 0x22, 0xdd, 0xcc]));
}

#[test]
fn piece_from_vector_truncates() {
    let initial = Value::Vector(vec![9, 8, 7, 6]);
    let result = expression(&[0x93, 0x03])
        .evaluate(&EvalContext::default(), Some(initial), None)
        .unwrap();
    assert_eq!(result, Value::Bytes(vec![9, 8, 7]));

    let short = Value::Vector(vec![9]);
    assert!(matches!(
        expression(&[0x93, 0x03]).evaluate(&EvalContext::default(), Some(short), None),
        Err(EvalError::ValueDomain { .. })
    ));
}

#[test]
fn call_frame_cfa_is_host_tagged() {
    let frame = StubFrame {
        frame_base: None,
        cfa: Some(0x7fff_0000),
        registers: None,
    };
    let ctx = EvalContext {
        frame: Some(&frame),
        ..EvalContext::default()
    };
    let result = expression(&[0x9c]).evaluate(&ctx, None, None).unwrap();
    assert_eq!(result, Value::HostAddress(0x7fff_0000));

    let no_cfa = StubFrame {
        frame_base: None,
        cfa: None,
        registers: None,
    };
    let ctx = EvalContext {
        frame: Some(&no_cfa),
        ..EvalContext::default()
    };
    assert!(matches!(
        expression(&[0x9c]).evaluate(&ctx, None, None),
        Err(EvalError::Frame { .. })
    ));
}

#[test]
fn frame_base_failure_propagates() {
    let frame = StubFrame {
        frame_base: None,
        cfa: None,
        registers: None,
    };
    let ctx = EvalContext {
        frame: Some(&frame),
        ..EvalContext::default()
    };
    assert!(matches!(
        expression(&[0x91, 0x04]).evaluate(&ctx, None, None),
        Err(EvalError::Frame { .. })
    ));
}

#[test]
fn register_errors_are_typed() {
    let mut regs = registers(&[(1, 0x1000)]);
    regs.non_scalar.push(7);
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };

    // reg9 has no native mapping
    assert!(matches!(
        expression(&[0x59]).evaluate(&ctx, None, None),
        Err(EvalError::Register { number: 9, .. })
    ));

    // reg7 exists but is not scalar-representable
    assert!(matches!(
        expression(&[0x57]).evaluate(&ctx, None, None),
        Err(EvalError::Register { number: 7, .. })
    ));

    // regx with a wide register number
    let regs = registers(&[(300, 0xaa)]);
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let result = expression(&[0x90, 0xac, 0x02])
        .evaluate(&ctx, None, None)
        .unwrap();
    assert_eq!(result.as_scalar().unwrap().as_u64(), 0xaa);
}

#[test]
fn bregx_offsets_a_register() {
    let regs = registers(&[(300, 0x5000)]);
    let ctx = EvalContext {
        registers: Some(&regs),
        ..EvalContext::default()
    };
    // bregx 300, -16
    let result = expression(&[0x92, 0xac, 0x02, 0x70])
        .evaluate(&ctx, None, None)
        .unwrap();
    assert_eq!(result, Value::LoadAddress(0x4ff0));
}

#[test]
fn tls_resolution() {
    let mut registry = ModuleRegistry::new();
    let module = registry.register(ModuleHandle {
        path: "/usr/lib/libtls.so".into(),
        load_bias: 0,
    });

    let thread = StubThread {
        tls_base: Some(0x7000_0000),
    };

    // constu 0x10, GNU_push_tls_address
    let expr = expression(&[0x10, 0x10, 0xe0]).with_module(module);
    let ctx = EvalContext {
        thread: Some(&thread),
        ..EvalContext::default()
    };
    let result = expr.evaluate(&ctx, None, None).unwrap();
    assert_eq!(result, Value::LoadAddress(0x7000_0010));

    // TLS not yet allocated for this thread
    let no_tls = StubThread { tls_base: None };
    let ctx = EvalContext {
        thread: Some(&no_tls),
        ..EvalContext::default()
    };
    assert!(matches!(
        expr.evaluate(&ctx, None, None),
        Err(EvalError::TlsUnavailable)
    ));

    // module can also arrive through the context
    let expr_without_module = expression(&[0x10, 0x10, 0xe0]);
    let ctx = EvalContext {
        thread: Some(&thread),
        module: Some(module),
        ..EvalContext::default()
    };
    assert!(expr_without_module.evaluate(&ctx, None, None).is_ok());

    // and without either, the context is incomplete
    let ctx = EvalContext {
        thread: Some(&thread),
        ..EvalContext::default()
    };
    assert!(matches!(
        expr_without_module.evaluate(&ctx, None, None),
        Err(EvalError::MissingContext { .. })
    ));
}

#[test]
fn evaluation_is_deterministic() {
    let process = StubProcess::little(0x1000, vec![0x11, 0x22, 0x33, 0x44]);
    let regs = registers(&[(2, 0x1000)]);
    let ctx = EvalContext {
        process: Some(&process),
        registers: Some(&regs),
        ..EvalContext::default()
    };
    let expr = expression(&[0x72, 0x00, 0x93, 0x04]);
    let first = expr.evaluate(&ctx, None, None).unwrap();
    let second = expr.evaluate(&ctx, None, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn empty_expression_is_no_location() {
    assert!(matches!(
        expression(&[]).evaluate(&EvalContext::default(), None, None),
        Err(EvalError::NoLocation)
    ));
}
