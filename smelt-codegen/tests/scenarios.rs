//! End-to-end scenarios: source-shaped trees through improvement,
//! validation, code generation and assembly, with the emitted text and the
//! final object bytes checked against the documented conventions.

use smelt_ast::{SemanticValidator, Tree, TreeBuilder, TreeImprover};
use smelt_codegen::Context;
use smelt_object::VirtualObject;

/// Improve and validate a built tree, then return the generated assembly
/// text.
fn generate(b: TreeBuilder) -> String {
    let mut tree = b.finish();
    TreeImprover::new(&mut tree).improve().unwrap();
    let diags = SemanticValidator::new(&tree).validate();
    assert!(!diags.has_errors(), "unexpected diagnostics:\n{diags}");
    let (text, gen_diags) = smelt_codegen::codegen::generate(&tree).unwrap();
    assert!(!gen_diags.has_errors(), "unexpected diagnostics:\n{gen_diags}");
    text
}

/// Full pipeline into an object.
fn compile(b: TreeBuilder) -> VirtualObject {
    let mut tree = b.finish();
    let mut object = VirtualObject::new();
    let diags = Context::new().compile(&mut tree, &mut object).unwrap();
    assert!(!diags.has_errors(), "unexpected diagnostics:\n{diags}");
    object
}

fn section<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
    let mut lines = Vec::new();
    let mut active = false;
    for line in text.lines() {
        if let Some(seg) = line.strip_prefix("segment ") {
            active = seg == name;
            continue;
        }
        if active && !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Assert that `expected` appears in `lines` in order (not necessarily
/// adjacent).
fn assert_subsequence(lines: &[&str], expected: &[&str]) {
    let mut it = lines.iter();
    for want in expected {
        assert!(
            it.any(|line| line == want),
            "\"{want}\" not found (in order) in:\n{}",
            lines.join("\n")
        );
    }
}

/// Assert that `expected` appears in `lines` as a contiguous run.
fn assert_run(lines: &[&str], expected: &[&str]) {
    let found = lines
        .windows(expected.len())
        .any(|w| w.iter().zip(expected).all(|(a, b)| a == b));
    assert!(
        found,
        "run {expected:?} not found in:\n{}",
        lines.join("\n")
    );
}

// ----------------------------------------------------------------------
// Scenario 1: a global scalar with an initial value.
// ----------------------------------------------------------------------

#[test]
fn global_scalar_init() {
    let mut b = TreeBuilder::new();
    let five = b.number(5);
    b.global_var("uint8", "g", Some(five));

    let text = generate(b);
    let data = section(&text, "data");
    assert_subsequence(&data, &["_g:", "db 5"]);

    let mut b = TreeBuilder::new();
    let five = b.number(5);
    b.global_var("uint8", "g", Some(five));
    let object = compile(b);
    let data = object.segment("data").unwrap();
    assert_eq!(data.label_offset("_g"), Some(0));
    assert_eq!(data.stream().as_slice(), &[0x05]);
}

// ----------------------------------------------------------------------
// Scenario 2: a local assignment, checked down to the bytes.
// ----------------------------------------------------------------------

fn local_assignment_tree() -> TreeBuilder {
    let mut b = TreeBuilder::new();
    let a = b.vdef("uint8", "a", None);
    let seven = b.number(7);
    let target = b.var("a");
    let assign = b.assign(target, seven);
    let zero = b.number(0);
    let ret = b.ret(Some(zero));
    b.func("int8", "main", vec![], vec![a, assign, ret]);
    b
}

#[test]
fn local_assignment_text() {
    let text = generate(local_assignment_tree());
    let code = section(&text, "code");
    assert_subsequence(
        &code,
        &[
            "global _main",
            "_main:",
            "push bp",
            "mov bp, sp",
            "sub sp, 1",
            "mov ax, 7",
            "mov [bp-1], al",
            "mov ax, 0",
            "add sp, 1",
            "pop bp",
            "ret",
        ],
    );
}

#[test]
fn local_assignment_bytes() {
    let object = compile(local_assignment_tree());
    let code = object.segment("code").unwrap();
    assert_eq!(
        code.stream().as_slice(),
        &[
            0x55, // push bp
            0x89, 0xE5, // mov bp, sp
            0x81, 0xEC, 0x01, 0x00, // sub sp, 1
            0xB8, 0x07, 0x00, // mov ax, 7
            0x88, 0x46, 0xFF, // mov [bp-1], al
            0xB8, 0x00, 0x00, // mov ax, 0
            0x81, 0xC4, 0x01, 0x00, // add sp, 1
            0x5D, // pop bp
            0xC3, // ret
        ]
    );
    assert_eq!(code.label_offset("_main"), Some(0));
    assert!(object.has_global_reference("_main"));
}

// ----------------------------------------------------------------------
// Scenario 3: if / else-if with signed comparisons.
// ----------------------------------------------------------------------

#[test]
fn signed_compare_chain() {
    let mut b = TreeBuilder::new();
    let x = b.vdef("int8", "x", None);

    let x2 = b.var("x");
    let zero2 = b.number(0);
    let neg_cond = b.expr("<", x2, zero2);
    let minus_one = b.number(-1);
    let ret_neg = b.ret(Some(minus_one));
    let else_if = b.if_stmt(neg_cond, vec![ret_neg], None, None);

    let x1 = b.var("x");
    let zero1 = b.number(0);
    let pos_cond = b.expr(">", x1, zero1);
    let one = b.number(1);
    let ret_pos = b.ret(Some(one));
    let ifs = b.if_stmt(pos_cond, vec![ret_pos], Some(else_if), None);

    let zero = b.number(0);
    let ret = b.ret(Some(zero));
    b.func("int8", "f", vec![x], vec![ifs, ret]);

    let text = generate(b);
    let code = section(&text, "code");

    // The argument is signed, so both comparisons use the signed jumps.
    assert!(code.iter().any(|l| l.starts_with("jle ")), "missing jle");
    assert!(code.iter().any(|l| l.starts_with("jge ")), "missing jge");
    assert!(!code.iter().any(|l| l.starts_with("jbe ")), "unsigned jump");

    // Arguments sit above the saved frame pointer and return address.
    assert_subsequence(&code, &["mov ax, [bp+4]", "cmp ax, cx"]);

    // Every return restores the frame before leaving.
    assert_run(&code, &["mov ax, 1", "pop bp", "ret"]);
    assert_run(&code, &["mov ax, -1", "pop bp", "ret"]);
}

// ----------------------------------------------------------------------
// Scenario 4: a global array indexed by a runtime value.
// ----------------------------------------------------------------------

#[test]
fn dynamic_array_index() {
    let mut b = TreeBuilder::new();
    b.global_array("uint8", "buf", &[10]);
    let i = b.vdef("uint8", "i", None);
    let idx = b.var("i");
    let use_buf = b.var_indexed("buf", vec![idx]);
    let ret = b.ret(Some(use_buf));
    b.func("uint8", "get", vec![i], vec![ret]);

    let text = generate(b);
    let code = section(&text, "code");
    // The index lands in di unscaled (element size 1), and the load uses
    // the low register half.
    assert_run(
        &code,
        &[
            "push ax",
            "mov ax, [bp+4]",
            "mov di, ax",
            "pop ax",
            "xor ax, ax",
            "mov al, [_data+di]",
        ],
    );
}

// ----------------------------------------------------------------------
// Scenario 5: structure access through a pointer.
// ----------------------------------------------------------------------

#[test]
fn struct_access_through_pointer() {
    let mut b = TreeBuilder::new();
    b.struct_decl("P", &[("uint8", "a"), ("uint16", "b")]);
    b.global_struct_var("P", "q", 1);
    let target = b.var_access("q", &[("b", true)]);
    let one = b.number(1);
    let assign = b.assign(target, one);
    b.func("int8", "f", vec![], vec![assign]);

    let text = generate(b);
    let code = section(&text, "code");
    // Load q's value into bx, then store at field offset 1.
    assert_run(&code, &["mov ax, 1", "mov bx, [_data]", "mov [bx+1], ax"]);
}

// ----------------------------------------------------------------------
// Scenario 6: break out of a nested for restores the inner frame.
// ----------------------------------------------------------------------

#[test]
fn break_out_of_nested_for() {
    let mut b = TreeBuilder::new();

    // Inner loop: for (uint8 j = 0; j < 3; j = j + 1) { break; }
    let j0 = b.number(0);
    let j_init = b.vdef("uint8", "j", Some(j0));
    let j1 = b.var("j");
    let three1 = b.number(3);
    let j_cond = b.expr("<", j1, three1);
    let j2 = b.var("j");
    let one1 = b.number(1);
    let j_plus = b.expr("+", j2, one1);
    let j3 = b.var("j");
    let j_step = b.assign(j3, j_plus);
    let brk = b.brk();
    let inner = b.for_stmt(j_init, j_cond, j_step, vec![brk]);

    // Outer loop: for (uint8 i = 0; i < 3; i = i + 1) { <inner> }
    let i0 = b.number(0);
    let i_init = b.vdef("uint8", "i", Some(i0));
    let i1 = b.var("i");
    let three2 = b.number(3);
    let i_cond = b.expr("<", i1, three2);
    let i2 = b.var("i");
    let one2 = b.number(1);
    let i_plus = b.expr("+", i2, one2);
    let i3 = b.var("i");
    let i_step = b.assign(i3, i_plus);
    let outer = b.for_stmt(i_init, i_cond, i_step, vec![inner]);

    b.func("int8", "f", vec![], vec![outer]);

    let text = generate(b);
    let code = section(&text, "code");

    // Both loop frames reserve one byte for their induction variable.
    assert_eq!(
        code.iter().filter(|l| **l == "sub sp, 1").count(),
        2,
        "each loop reserves its frame once"
    );

    // The break restores exactly the inner frame before jumping.
    let pos = code
        .iter()
        .position(|l| *l == "add sp, 1")
        .expect("break restores the inner scope");
    assert!(
        code[pos + 1].starts_with("jmp "),
        "the restore is followed by the break jump, got {}",
        code[pos + 1]
    );
}

// ----------------------------------------------------------------------
// Further behaviour pinned by the documented conventions.
// ----------------------------------------------------------------------

#[test]
fn while_with_logical_or_tests_materialised_result() {
    let mut b = TreeBuilder::new();
    let x = b.vdef("uint8", "x", None);

    let x1 = b.var("x");
    let zero = b.number(0);
    let left = b.expr("!=", x1, zero);
    let x2 = b.var("x");
    let three = b.number(3);
    let right = b.expr("!=", x2, three);
    let cond = b.expr("||", left, right);

    let x3 = b.var("x");
    let one = b.number(1);
    let dec = b.expr("-", x3, one);
    let x4 = b.var("x");
    let step = b.assign(x4, dec);

    let w = b.while_stmt(cond, vec![step]);
    let ret = b.ret(None);
    b.func("int8", "f", vec![x], vec![w, ret]);

    let text = generate(b);
    let code = section(&text, "code");

    // The || owner materialises 0/1, then the loop tests it against zero.
    assert_subsequence(&code, &["mov ax, 0", "mov ax, 1", "cmp ax, 0"]);
    // Passing comparisons escape to the true label under ||.
    assert!(code.iter().filter(|l| l.starts_with("jne ")).count() >= 2);
}

#[test]
fn pointer_write_through_local() {
    let mut b = TreeBuilder::new();
    let a = b.vdef("uint8", "a", None);
    let p = b.vdef_ptr("uint8", "p", 1);
    let a_use = b.var("a");
    let addr = b.addr_of(a_use);
    let p_use = b.var("p");
    let take = b.assign(p_use, addr);
    let p_use2 = b.var("p");
    let deref = b.deref(p_use2, 1);
    let five = b.number(5);
    let store = b.assign(deref, five);
    let ret = b.ret(None);
    b.func("int8", "f", vec![], vec![a, p, take, store, ret]);

    let text = generate(b);
    let code = section(&text, "code");
    // p lives below a: a at bp-1, p at bp-3 (pointers are words).
    assert_run(&code, &["lea ax, [bp-1]", "mov [bp-3], ax"]);
    assert_run(
        &code,
        &[
            "mov ax, 5",
            "push ax",
            "mov bx, [bp-3]",
            "pop ax",
            "mov [bx], al",
        ],
    );
}

#[test]
fn char_array_through_pointer() {
    let mut b = TreeBuilder::new();
    let msg_init = b.str_lit("Hello World");
    let msg = b.vdef_ptr("uint8", "message", 1);
    b.tree_mut()
        .set_role(msg, smelt_ast::Role::ValueExp, msg_init)
        .unwrap();
    let one = b.number(1);
    let use_msg = b.var_indexed("message", vec![one]);
    let ret = b.ret(Some(use_msg));
    b.func("uint8", "f", vec![], vec![msg, ret]);

    let text = generate(b);
    let code = section(&text, "code");
    let data = section(&text, "data");

    // The string constant lands in the data segment, NUL-terminated.
    assert!(data.iter().any(|l| *l == "db 'Hello World', 0"));
    // Indexing the pointer loads its value first, then reads one byte.
    assert_run(
        &code,
        &["mov bx, [bp-2]", "xor ax, ax", "mov al, [bx+1]"],
    );
}

#[test]
fn compound_assignment_reads_then_writes() {
    let mut b = TreeBuilder::new();
    let a = b.vdef("uint8", "a", None);
    let five = b.number(5);
    let target = b.var("a");
    let add = b.assign_op("+=", target, five);
    let ret = b.ret(None);
    b.func("int8", "f", vec![], vec![a, add, ret]);

    let text = generate(b);
    let code = section(&text, "code");
    assert_run(
        &code,
        &[
            "mov ax, 5",
            "mov dx, [bp-1]",
            "add dx, ax",
            "mov ax, dx",
            "mov [bp-1], al",
        ],
    );
}

#[test]
fn call_pushes_arguments_in_reverse() {
    let mut b = TreeBuilder::new();
    let ax_ = b.vdef("uint8", "a", None);
    let bx_ = b.vdef("uint8", "b", None);
    b.func_decl("int8", "write", vec![ax_, bx_]);

    let one = b.number(1);
    let two = b.number(2);
    let call = b.call("write", vec![one, two]);
    let ret = b.ret(None);
    b.func("int8", "main", vec![], vec![call, ret]);

    let text = generate(b);
    let code = section(&text, "code");
    assert_subsequence(&code, &["extern _write"]);
    assert_run(
        &code,
        &[
            "mov ax, 2",
            "push ax",
            "mov ax, 1",
            "push ax",
            "call _write",
            "add sp, 4",
        ],
    );

    // Through the whole pipeline the import shows up on the object.
    let mut b = TreeBuilder::new();
    let a2 = b.vdef("uint8", "a", None);
    b.func_decl("int8", "write", vec![a2]);
    let one = b.number(1);
    let call = b.call("write", vec![one]);
    let ret = b.ret(None);
    b.func("int8", "main", vec![], vec![call, ret]);
    let object = compile(b);
    assert!(object.has_external_reference("_write"));
    let code = object.segment("code").unwrap();
    assert!(code
        .relocations()
        .iter()
        .any(|r| r.target == "_write"));
}

#[test]
fn whole_structure_assignment_block_moves() {
    let mut b = TreeBuilder::new();
    b.struct_decl("P", &[("uint8", "a"), ("uint16", "b")]);
    b.global_struct_var("P", "src", 0);
    b.global_struct_var("P", "dst", 0);
    let src_use = b.var("src");
    let dst_use = b.var("dst");
    let copy = b.assign(dst_use, src_use);
    b.func("int8", "f", vec![], vec![copy]);

    let text = generate(b);
    let code = section(&text, "code");
    assert_subsequence(
        &code,
        &["lea si, [_data]", "lea di, [_data+3]", "mov cx, 3", "lodsb", "stosb"],
    );
    // The loop label precedes the string ops so `loop` re-enters the move.
    let lodsb = code.iter().position(|l| *l == "lodsb").unwrap();
    assert!(code[lodsb - 1].ends_with(':'), "no loop label before lodsb");
    let target = code[lodsb - 1].trim_end_matches(':');
    assert_eq!(code[lodsb + 2], format!("loop {target}"));
}

#[test]
fn resolver_is_deterministic() {
    // Resolving the same access twice yields the same address text.
    let mut b = TreeBuilder::new();
    b.global_var("uint16", "g", None);
    let a = b.vdef("uint16", "a", None);
    let g1 = b.var("g");
    let a1 = b.var("a");
    let s1 = b.assign(a1, g1);
    let g2 = b.var("g");
    let a2 = b.var("a");
    let s2 = b.assign(a2, g2);
    let ret = b.ret(None);
    b.func("int8", "f", vec![], vec![a, s1, s2, ret]);

    let text = generate(b);
    let code = section(&text, "code");
    let loads: Vec<_> = code.iter().filter(|l| **l == "mov ax, [_data]").collect();
    let stores: Vec<_> = code.iter().filter(|l| **l == "mov [bp-2], ax").collect();
    assert_eq!(loads.len(), 2);
    assert_eq!(stores.len(), 2);
}

#[test]
fn validation_errors_block_code_generation() {
    let mut b = TreeBuilder::new();
    let ghost = b.var("ghost");
    let ret = b.ret(Some(ghost));
    b.func("int8", "main", vec![], vec![ret]);

    let mut tree = b.finish();
    let mut object = VirtualObject::new();
    let diags = Context::new().compile(&mut tree, &mut object).unwrap();
    assert!(diags.has_errors());
    assert!(object.segments().is_empty(), "no code on a failed compile");
}

#[test]
fn ifdef_gates_declarations() {
    let mut b = TreeBuilder::new();
    b.macro_define("ENABLE_G", None);
    let g = b.vdef("uint8", "g", None);
    b.macro_ifdef("ENABLE_G", vec![g]);
    let h = b.vdef("uint8", "h", None);
    b.macro_ifdef("DISABLED", vec![h]);

    let mut tree = b.finish();
    let mut object = VirtualObject::new();
    let diags = Context::new().compile(&mut tree, &mut object).unwrap();
    assert!(!diags.has_errors(), "{diags}");
    let data = object.segment("data").unwrap();
    assert_eq!(data.label_offset("_g"), Some(0));
    assert_eq!(data.label_offset("_h"), None);
}
