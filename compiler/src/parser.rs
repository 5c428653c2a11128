// Parser for HLO module text.
//
// Parses a token stream (from the lexer) into the untyped `ast::ModuleAst`.
// Uses chumsky combinators.
//
// Grammar (whitespace-insensitive):
//   module      := ('HloModule' NAME (',' attribute)*)? computation+
//   computation := 'ENTRY'? NAME '{' instruction* '}'
//   instruction := 'ROOT'? NAME '=' shape NAME '(' operands? ')' (',' attribute)*
//   shape       := array | '(' array (',' array)* ')'
//   array       := NAME '[' ints? ']' ('{' ints? '}')?
//   attribute   := NAME '=' ('{' ints? '}' | '{' slice (',' slice)* '}' | NAME | INT)
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub module: Option<ModuleAst>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse HLO module text. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let (module, parse_errors) = module_parser().parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        module,
        errors: all_errors,
    }
}

fn module_parser<'tokens, I>(
) -> impl Parser<'tokens, I, ModuleAst, extra::Err<Rich<'tokens, Token, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let name = select! {
        Token::Name(name) = e => Ident { name, span: e.span() },
    };

    let int = select! { Token::Int(n) => n };

    // ── `{1,0}` ──

    let int_list = int
        .clone()
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace));

    // ── Shapes ──

    let dims = int
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    let array_shape = name
        .clone()
        .then(dims)
        .then(int_list.clone().or_not())
        .map_with(|((element_type, dims), layout), e| ShapeAst::Array {
            element_type,
            dims,
            layout,
            span: e.span(),
        });

    // Tuple elements are array shapes; nested tuples are not accepted.
    let tuple_shape = array_shape
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .map_with(|shapes, e| ShapeAst::Tuple(shapes, e.span()));

    let shape = array_shape.or(tuple_shape);

    // ── Attributes ──

    let slice_entry = just(Token::LBracket)
        .ignore_then(int.clone())
        .then_ignore(just(Token::Colon))
        .then(int.clone())
        .then(just(Token::Colon).ignore_then(int).or_not())
        .then_ignore(just(Token::RBracket))
        .map(|((start, limit), stride)| SliceAst {
            start,
            limit,
            stride,
        });

    let slices = slice_entry
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|entries, e| AttrValue::Slices(entries, e.span()));

    let attr_value = slices
        .or(int_list
            .clone()
            .map_with(|values, e| AttrValue::Ints(values, e.span())))
        .or(name.clone().map(AttrValue::Name))
        .or(select! { Token::Int(n) = e => AttrValue::Int(n, e.span()) });

    let attribute = name
        .clone()
        .then_ignore(just(Token::Equals))
        .then(attr_value)
        .map(|(name, value)| AttributeAst { name, value });

    // ── Instructions ──

    let operand = select! {
        Token::Int(n) = e => OperandAst::Int(n, e.span()),
        Token::Float(f) = e => OperandAst::Float(f, e.span()),
    }
    .or(name.clone().map(OperandAst::Name));

    let operands = operand
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let trailing_attributes = just(Token::Comma)
        .ignore_then(attribute.clone())
        .repeated()
        .collect::<Vec<_>>();

    let instruction = just(Token::Root)
        .or_not()
        .then(name.clone())
        .then_ignore(just(Token::Equals))
        .then(shape)
        .then(name.clone())
        .then(operands)
        .then(trailing_attributes.clone())
        .map_with(
            |(((((root, name), shape), opcode), operands), attributes), e| InstructionAst {
                name,
                is_root: root.is_some(),
                shape,
                opcode,
                operands,
                attributes,
                span: e.span(),
            },
        );

    // ── Computations ──

    let computation = just(Token::Entry)
        .or_not()
        .then(name.clone())
        .then(
            instruction
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map_with(|((entry, name), instructions), e| ComputationAst {
            name,
            is_entry: entry.is_some(),
            instructions,
            span: e.span(),
        });

    // ── Module ──

    let header = just(Token::HloModule)
        .ignore_then(name)
        .then_ignore(trailing_attributes);

    header
        .or_not()
        .then(computation.repeated().at_least(1).collect::<Vec<_>>())
        .then_ignore(end())
        .map(|(name, computations)| ModuleAst { name, computations })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> ModuleAst {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected parse errors: {:?}",
            result.errors
        );
        result.module.expect("parse produced no module")
    }

    #[test]
    fn single_computation() {
        let module = parse_ok(
            r#"
            HloModule m
            ENTRY main {
              p0 = f32[32,64]{1,0} parameter(0)
              ROOT n = f32[32,64]{1,0} negate(p0)
            }
            "#,
        );
        assert_eq!(module.name.as_ref().map(|n| n.name.as_str()), Some("m"));
        assert_eq!(module.computations.len(), 1);
        let comp = &module.computations[0];
        assert!(comp.is_entry);
        assert_eq!(comp.instructions.len(), 2);
        assert!(!comp.instructions[0].is_root);
        assert!(matches!(comp.instructions[0].operands[0], OperandAst::Int(0, _)));
        assert!(comp.instructions[1].is_root);
        assert_eq!(comp.instructions[1].opcode.name, "negate");
    }

    #[test]
    fn shapes_and_layouts() {
        let module = parse_ok(
            r#"
            ENTRY e {
              s = f32[] parameter(0)
              a = bf16[2,3,4]{0,1,2} parameter(1)
              ROOT t = (f32[], bf16[2,3,4]) tuple(s, a)
            }
            "#,
        );
        let instrs = &module.computations[0].instructions;
        match &instrs[0].shape {
            ShapeAst::Array { dims, layout, .. } => {
                assert!(dims.is_empty());
                assert!(layout.is_none());
            }
            other => panic!("expected array shape, got {:?}", other),
        }
        match &instrs[1].shape {
            ShapeAst::Array {
                element_type,
                dims,
                layout,
                ..
            } => {
                assert_eq!(element_type.name, "bf16");
                assert_eq!(dims, &vec![2, 3, 4]);
                assert_eq!(layout.as_deref(), Some(&[0, 1, 2][..]));
            }
            other => panic!("expected array shape, got {:?}", other),
        }
        assert!(matches!(&instrs[2].shape, ShapeAst::Tuple(elems, _) if elems.len() == 2));
    }

    #[test]
    fn attributes() {
        let module = parse_ok(
            r#"
            ENTRY e {
              p0 = f32[32,64] parameter(0)
              s = f32[16,32] slice(p0), slice={[0:16], [0:64:2]}
              b = f32[8,16,32] broadcast(s), dimensions={1,2}
              ROOT f = f32[8,16,32] fusion(b), kind=kLoop, calls=body
            }
            "#,
        );
        let instrs = &module.computations[0].instructions;
        match &instrs[1].attributes[0].value {
            AttrValue::Slices(entries, _) => {
                assert_eq!(
                    entries,
                    &vec![
                        SliceAst {
                            start: 0,
                            limit: 16,
                            stride: None
                        },
                        SliceAst {
                            start: 0,
                            limit: 64,
                            stride: Some(2)
                        },
                    ]
                );
            }
            other => panic!("expected slices, got {:?}", other),
        }
        assert!(matches!(&instrs[2].attributes[0].value, AttrValue::Ints(v, _) if v == &vec![1, 2]));
        assert_eq!(instrs[3].attributes.len(), 2);
        assert!(matches!(&instrs[3].attributes[1].value, AttrValue::Name(n) if n.name == "body"));
    }

    #[test]
    fn multiple_computations() {
        let module = parse_ok(
            r#"
            HloModule m
            add {
              a = f32[] parameter(0)
              b = f32[] parameter(1)
              ROOT s = f32[] add(a, b)
            }
            ENTRY main {
              p0 = f32[8,128] parameter(0)
              c = f32[] constant(0)
              ROOT r = f32[8] reduce(p0, c), dimensions={1}, to_apply=add
            }
            "#,
        );
        assert_eq!(module.computations.len(), 2);
        assert!(!module.computations[0].is_entry);
        assert!(module.computations[1].is_entry);
    }

    #[test]
    fn missing_equals_is_an_error() {
        let result = parse("ENTRY e { p0 f32[4] parameter(0) }");
        assert!(!result.errors.is_empty());
    }
}
